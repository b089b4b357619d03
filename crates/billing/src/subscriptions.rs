//! Subscription reconciliation, access checks and cancellation
//!
//! The processor is the source of truth for whether a preapproval is live.
//! Access checks always ask it and never cache the answer; any failure to get
//! a definitive `authorized` denies access.

use std::sync::Arc;

use medibook_shared::{Subscription, SubscriptionStatus, SubscriptionStore};
use uuid::Uuid;

use crate::client::PaymentProcessor;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct SubscriptionService {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionService {
    pub fn new(processor: Arc<dyn PaymentProcessor>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { processor, store }
    }

    /// True only when the processor reports the preapproval as `authorized`.
    /// Non-2xx responses, timeouts and network errors all yield false.
    pub async fn check_external_subscription_status(&self, preapproval_id: &str) -> bool {
        match self.processor.get_preapproval(preapproval_id).await {
            Ok(preapproval) => {
                tracing::debug!(
                    preapproval_id = %preapproval_id,
                    status = %preapproval.status,
                    "Fetched preapproval status"
                );
                preapproval.is_authorized()
            }
            Err(e) => {
                tracing::warn!(
                    preapproval_id = %preapproval_id,
                    error = %e,
                    "Preapproval status check failed, denying access"
                );
                false
            }
        }
    }

    /// Premium content gate: a local subscription with a processor reference
    /// that the processor currently reports as authorized
    pub async fn has_premium_access(&self, user_id: Uuid) -> BillingResult<bool> {
        let Some(subscription) = self.store.find_latest_for_user(user_id).await? else {
            return Ok(false);
        };

        let Some(preapproval_id) = subscription.preapproval_id.as_deref() else {
            return Ok(false);
        };

        Ok(self.check_external_subscription_status(preapproval_id).await)
    }

    /// Cancel at the processor first; the local row only moves to
    /// `CANCELLED` once the remote call succeeded
    pub async fn cancel_subscription(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .find_latest_for_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for user {}", user_id)))?;

        let preapproval_id = subscription.preapproval_id.as_deref().ok_or_else(|| {
            BillingError::NotFound(format!(
                "Subscription {} has no external reference",
                subscription.id
            ))
        })?;

        self.processor
            .cancel_preapproval(preapproval_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    preapproval_id = %preapproval_id,
                    error = %e,
                    "Failed to cancel preapproval, local subscription unchanged"
                );
                e
            })?;

        let updated = self
            .store
            .update_status(subscription.id, SubscriptionStatus::Cancelled)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} disappeared", subscription.id))
            })?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %updated.id,
            "Subscription cancelled"
        );

        Ok(updated)
    }

    /// Project the processor's preapproval status onto the local row
    pub async fn sync_from_processor(&self, preapproval_id: &str) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .find_by_preapproval(preapproval_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("No subscription for preapproval {}", preapproval_id))
            })?;

        let preapproval = self.processor.get_preapproval(preapproval_id).await?;
        let status = SubscriptionStatus::from_processor(&preapproval.status);

        if status == subscription.status {
            return Ok(subscription);
        }

        let updated = self
            .store
            .update_status(subscription.id, status)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} disappeared", subscription.id))
            })?;

        tracing::info!(
            subscription_id = %updated.id,
            preapproval_id = %preapproval_id,
            from = %subscription.status,
            to = %updated.status,
            "Subscription status synced from Mercado Pago"
        );

        Ok(updated)
    }
}
