// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::float_cmp))]

//! MediBook Billing Module
//!
//! Handles Mercado Pago integration for appointment payments and premium
//! subscriptions.
//!
//! ## Features
//!
//! - **Payment Reconciliation**: Project processor payment state onto local rows
//! - **Subscriptions**: Fail-closed premium access checks and cancellation
//! - **Webhooks**: Signature verification, parsing and event handling
//! - **Notifications**: WhatsApp confirmation messages

pub mod client;
pub mod error;
pub mod notifications;
pub mod payments;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod testing;

// Client
pub use client::{
    MercadoPagoClient, MercadoPagoConfig, PaymentProcessor, Preapproval, ProcessorPayment,
};

// Error
pub use error::{BillingError, BillingResult};

// Notifications
pub use notifications::{AppointmentNotifier, WhatsAppConfig, WhatsAppNotifier};

// Payments
pub use payments::{PaymentService, PollSummary};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::{parse_notification, verify_signature, BillingWebhookHandler};

use std::sync::Arc;

use medibook_shared::{PgPaymentStore, PgSubscriptionStore};
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub config: MercadoPagoConfig,
    pub payments: PaymentService,
    pub subscriptions: SubscriptionService,
    pub webhooks: BillingWebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let client = MercadoPagoClient::from_env()?;
        let notifier = WhatsAppNotifier::from_env()?;

        Ok(Self::new(
            client.config().clone(),
            Arc::new(client),
            Arc::new(PgPaymentStore::new(pool.clone())),
            Arc::new(PgSubscriptionStore::new(pool)),
            Arc::new(notifier),
        ))
    }

    /// Create a billing service from explicit collaborators
    pub fn new(
        config: MercadoPagoConfig,
        processor: Arc<dyn PaymentProcessor>,
        payment_store: Arc<dyn medibook_shared::PaymentStore>,
        subscription_store: Arc<dyn medibook_shared::SubscriptionStore>,
        notifier: Arc<dyn AppointmentNotifier>,
    ) -> Self {
        let payments = PaymentService::new(processor.clone(), payment_store);
        let subscriptions = SubscriptionService::new(processor, subscription_store);
        let webhooks = BillingWebhookHandler::new(payments.clone(), subscriptions.clone(), notifier);

        Self {
            config,
            payments,
            subscriptions,
            webhooks,
        }
    }

    /// Secret used to verify inbound notifications, if configured
    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.webhook_secret.as_deref()
    }
}
