//! Webhook event store
//!
//! Every inbound webhook call is persisted here before any side effect runs.
//! Rows only ever move forward:
//!
//! ```text
//! unclaimed --claim--> in-flight --success--> processed
//!     ^                    |
//!     +----release---------+--permanent failure--> dead-lettered
//! ```
//!
//! `processed` flips from false to true exactly once. A dead-lettered event
//! keeps `processed = false` but is no longer returned by
//! [`WebhookEventStore::get_unprocessed_events`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreResult;

/// What to do when an event with an already-seen `(type, data_id)` arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Store every delivery as its own row (full audit trail)
    #[default]
    Replay,
    /// Keep only the first row per `(type, data_id)`
    Dedupe,
}

impl DuplicatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicatePolicy::Replay => "replay",
            DuplicatePolicy::Dedupe => "dedupe",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" => Ok(DuplicatePolicy::Replay),
            "dedupe" => Ok(DuplicatePolicy::Dedupe),
            other => Err(format!(
                "invalid duplicate policy '{}', expected 'replay' or 'dedupe'",
                other
            )),
        }
    }
}

/// An inbound event as received, before it has an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    pub action: Option<String>,
    pub api_version: Option<String>,
    pub data_id: Option<String>,
    pub date_created: Option<OffsetDateTime>,
    pub event_type: String,
    pub raw_data: serde_json::Value,
}

impl NewWebhookEvent {
    pub fn new(event_type: impl Into<String>, raw_data: serde_json::Value) -> Self {
        Self {
            action: None,
            api_version: None,
            data_id: None,
            date_created: None,
            event_type: event_type.into(),
            raw_data,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn data_id(mut self, data_id: impl Into<String>) -> Self {
        self.data_id = Some(data_id.into());
        self
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub action: Option<String>,
    pub api_version: Option<String>,
    pub data_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub date_created: Option<OffsetDateTime>,
    pub event_type: String,
    pub raw_data: serde_json::Value,
    pub processed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    pub attempts: i32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub failed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl WebhookEventRecord {
    pub fn is_dead_lettered(&self) -> bool {
        self.failed_at.is_some()
    }
}

/// Result of storing an inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum CreatedEvent {
    Stored(WebhookEventRecord),
    /// Dedupe policy found an earlier row for the same `(type, data_id)`
    Duplicate(WebhookEventRecord),
}

impl CreatedEvent {
    pub fn record(&self) -> &WebhookEventRecord {
        match self {
            CreatedEvent::Stored(record) | CreatedEvent::Duplicate(record) => record,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreatedEvent::Duplicate(_))
    }
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Persist an inbound event with `processed = false`
    async fn create_event(
        &self,
        input: NewWebhookEvent,
        policy: DuplicatePolicy,
    ) -> StoreResult<CreatedEvent>;

    /// Oldest-first unprocessed, non dead-lettered events
    async fn get_unprocessed_events(&self, limit: i64) -> StoreResult<Vec<WebhookEventRecord>>;

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEventRecord>>;

    /// Take exclusive processing rights. Returns `None` when the event is
    /// processed, dead-lettered, or claimed by someone else less than
    /// `stale_after` ago.
    async fn claim_event(
        &self,
        id: Uuid,
        stale_after: Duration,
    ) -> StoreResult<Option<WebhookEventRecord>>;

    // The three writes below are fenced on the claim: `attempt` is the
    // `attempts` value returned by `claim_event`. Once another worker takes
    // over a stale claim the counter moves on and the old holder's writes
    // match nothing. Each returns false when the claim was lost.

    /// Flip `processed` to true
    async fn mark_processed(&self, id: Uuid, attempt: i32) -> StoreResult<bool>;

    /// Drop the claim after a retryable failure
    async fn release_event(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool>;

    /// Dead-letter the event after a permanent failure
    async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool>;
}

const EVENT_COLUMNS: &str = r#"
    id, action, api_version, data_id, date_created, event_type, raw_data,
    processed, claimed_at, attempts, last_error, failed_at, processed_at, created_at
"#;

/// Postgres-backed event store
#[derive(Clone)]
pub struct PgWebhookEventStore {
    pool: PgPool,
}

impl PgWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert<'e, E>(executor: E, input: &NewWebhookEvent) -> StoreResult<WebhookEventRecord>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let record = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            r#"
            INSERT INTO webhook_events
                (action, api_version, data_id, date_created, event_type, raw_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&input.action)
        .bind(&input.api_version)
        .bind(&input.data_id)
        .bind(input.date_created)
        .bind(&input.event_type)
        .bind(&input.raw_data)
        .fetch_one(executor)
        .await?;

        Ok(record)
    }
}

#[async_trait]
impl WebhookEventStore for PgWebhookEventStore {
    async fn create_event(
        &self,
        input: NewWebhookEvent,
        policy: DuplicatePolicy,
    ) -> StoreResult<CreatedEvent> {
        let data_id = match (policy, input.data_id.as_deref()) {
            (DuplicatePolicy::Dedupe, Some(data_id)) => data_id.to_string(),
            _ => return Ok(CreatedEvent::Stored(Self::insert(&self.pool, &input).await?)),
        };

        // Serialise check-and-insert per key so two concurrent deliveries of
        // the same event cannot both pass the existence check
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
            .bind(&input.event_type)
            .bind(&data_id)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE event_type = $1 AND data_id = $2
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(&input.event_type)
        .bind(&data_id)
        .fetch_optional(&mut *tx)
        .await?;

        let created = match existing {
            Some(record) => CreatedEvent::Duplicate(record),
            None => CreatedEvent::Stored(Self::insert(&mut *tx, &input).await?),
        };

        tx.commit().await?;
        Ok(created)
    }

    async fn get_unprocessed_events(&self, limit: i64) -> StoreResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM webhook_events
            WHERE processed = FALSE AND failed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEventRecord>> {
        let record = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn claim_event(
        &self,
        id: Uuid,
        stale_after: Duration,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        // Conditional write: only one caller can move the row out of the
        // unclaimed state. A claim older than stale_after is treated as a
        // crashed worker and may be taken over.
        let record = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            r#"
            UPDATE webhook_events
            SET claimed_at = NOW(),
                attempts = attempts + 1
            WHERE id = $1
              AND processed = FALSE
              AND failed_at IS NULL
              AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $2))
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_processed(&self, id: Uuid, attempt: i32) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE,
                processed_at = NOW(),
                claimed_at = NULL,
                last_error = NULL
            WHERE id = $1
              AND attempts = $2
              AND claimed_at IS NOT NULL
              AND processed = FALSE
              AND failed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_event(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET claimed_at = NULL, last_error = $3
            WHERE id = $1
              AND attempts = $2
              AND claimed_at IS NOT NULL
              AND processed = FALSE
              AND failed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET claimed_at = NULL, failed_at = NOW(), last_error = $3
            WHERE id = $1
              AND attempts = $2
              AND claimed_at IS NOT NULL
              AND processed = FALSE
              AND failed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
