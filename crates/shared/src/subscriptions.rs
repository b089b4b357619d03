//! Subscription persistence
//!
//! The local status is a cached projection of the processor's preapproval.
//! Access decisions must not trust it on its own.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{Subscription, SubscriptionStatus};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Most recently created subscription for a user
    async fn find_latest_for_user(&self, user_id: Uuid) -> StoreResult<Option<Subscription>>;

    async fn find_by_preapproval(&self, preapproval_id: &str) -> StoreResult<Option<Subscription>>;

    /// Returns the updated row, or `None` if it no longer exists
    async fn update_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> StoreResult<Option<Subscription>>;
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    preapproval_id: Option<String>,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: crate::models::UnknownStatus| {
                StoreError::corrupt("subscriptions", e.to_string())
            })?;

        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            preapproval_id: row.preapproval_id,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_latest_for_user(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, preapproval_id, status, created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_by_preapproval(&self, preapproval_id: &str) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, preapproval_id, status, created_at, updated_at
            FROM subscriptions
            WHERE preapproval_id = $1
            "#,
        )
        .bind(preapproval_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, preapproval_id, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }
}
