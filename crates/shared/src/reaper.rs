//! Stale-appointment reaper
//!
//! Appointments that sit in `PENDING` with an unpaid payment past the
//! timeout window are archived to `appointment_history` and deleted from the
//! live table in a single transaction. The job is externally triggered (cron
//! endpoint or worker schedule) and safe to run repeatedly: anything already
//! deleted no longer matches the selection predicate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::AppointmentHistory;

/// Archive status written for reaped appointments
pub const ARCHIVED_STATUS: &str = "CANCELLED";

/// Archive reason written for reaped appointments
pub const TIMEOUT_REASON: &str = "TIMEOUT_PAYMENT";

pub const DEFAULT_TIMEOUT_MINUTES: i64 = 60;
pub const DEFAULT_BATCH_SIZE: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// How long an appointment may stay pending before it is reaped
    pub timeout: Duration,
    /// Maximum appointments archived per run
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::minutes(DEFAULT_TIMEOUT_MINUTES),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[async_trait]
pub trait AppointmentArchive: Send + Sync {
    /// In one atomic unit of work: select up to `limit` pending appointments
    /// created before `cutoff` whose payment is pending (or missing), write
    /// one history row each with the given status and reason, and delete the
    /// selected appointments. Either everything persists or nothing does.
    async fn archive_stale_pending(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
        status: &str,
        reason: &str,
    ) -> StoreResult<Vec<AppointmentHistory>>;
}

/// Result of one reaper run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReapResult {
    pub processed: usize,
    pub archived_ids: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone)]
pub struct StaleAppointmentReaper {
    store: Arc<dyn AppointmentArchive>,
    config: ReaperConfig,
}

impl StaleAppointmentReaper {
    pub fn new(store: Arc<dyn AppointmentArchive>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> ReaperConfig {
        self.config
    }

    pub async fn run(&self) -> StoreResult<ReapResult> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    /// Run the reaper as if the current time were `now`
    pub async fn run_at(&self, now: OffsetDateTime) -> StoreResult<ReapResult> {
        let cutoff = now - self.config.timeout;

        let archived = self
            .store
            .archive_stale_pending(cutoff, self.config.batch_size, ARCHIVED_STATUS, TIMEOUT_REASON)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, cutoff = %cutoff, "Stale appointment cleanup failed, nothing archived");
                e
            })?;

        let archived_ids: Vec<Uuid> = archived.iter().map(|h| h.original_id).collect();

        if archived_ids.is_empty() {
            tracing::debug!(cutoff = %cutoff, "No stale pending appointments");
        } else {
            tracing::info!(
                processed = archived_ids.len(),
                cutoff = %cutoff,
                reason = TIMEOUT_REASON,
                "Archived and deleted stale pending appointments"
            );
        }

        Ok(ReapResult {
            processed: archived_ids.len(),
            archived_ids,
            timestamp: now,
        })
    }
}

#[derive(Debug, FromRow)]
struct StaleAppointmentRow {
    id: Uuid,
    user_id: Uuid,
    doctor_id: Uuid,
    date: OffsetDateTime,
    amount: f64,
}

/// Postgres implementation of the archive-then-delete transaction
#[derive(Clone)]
pub struct PgAppointmentArchive {
    pool: PgPool,
}

impl PgAppointmentArchive {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppointmentArchive for PgAppointmentArchive {
    async fn archive_stale_pending(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
        status: &str,
        reason: &str,
    ) -> StoreResult<Vec<AppointmentHistory>> {
        let mut tx = self.pool.begin().await?;

        // SKIP LOCKED keeps concurrent runs on disjoint rows
        let stale: Vec<StaleAppointmentRow> = sqlx::query_as(
            r#"
            SELECT a.id, a.user_id, a.doctor_id, a.date, COALESCE(p.amount, 0) AS amount
            FROM appointments a
            LEFT JOIN payments p ON p.appointment_id = a.id
            WHERE a.status = 'PENDING'
              AND a.created_at < $1
              AND (p.id IS NULL OR p.status = 'PENDING')
            ORDER BY a.created_at ASC
            LIMIT $2
            FOR UPDATE OF a SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if stale.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut archived = Vec::with_capacity(stale.len());
        for row in &stale {
            let history: AppointmentHistory = sqlx::query_as(
                r#"
                INSERT INTO appointment_history
                    (original_id, user_id, doctor_id, date, status, reason, amount)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id, original_id, user_id, doctor_id, date, status, reason, amount, archived_at
                "#,
            )
            .bind(row.id)
            .bind(row.user_id)
            .bind(row.doctor_id)
            .bind(row.date)
            .bind(status)
            .bind(reason)
            .bind(row.amount)
            .fetch_one(&mut *tx)
            .await?;
            archived.push(history);
        }

        let ids: Vec<Uuid> = stale.iter().map(|row| row.id).collect();
        let deleted = sqlx::query("DELETE FROM appointments WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted != ids.len() as u64 {
            // Dropping the transaction rolls back the history inserts
            return Err(StoreError::Conflict(format!(
                "archived {} appointments but deleted {}",
                ids.len(),
                deleted
            )));
        }

        tx.commit().await?;
        Ok(archived)
    }
}
