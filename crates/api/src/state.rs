//! Application state

use std::sync::Arc;

use anyhow::Context;
use medibook_billing::BillingService;
use medibook_shared::{
    AppointmentArchive, PgAppointmentArchive, PgWebhookEventStore, StaleAppointmentReaper,
    WebhookEventStore, WebhookProcessor,
};
use sqlx::PgPool;

use crate::{auth::JwtManager, config::Config, dispatch::WebhookDispatcher};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    /// Durable record of inbound webhook calls
    pub events: Arc<dyn WebhookEventStore>,
    pub processor: WebhookProcessor,
    /// Routes stored events to the billing or WhatsApp handler
    pub dispatcher: Arc<WebhookDispatcher>,
    pub reaper: StaleAppointmentReaper,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())
            .context("Mercado Pago billing is not configured")?;
        if billing.webhook_secret().is_none() {
            tracing::warn!(
                "MERCADOPAGO_WEBHOOK_SECRET not set - webhook signatures will not be verified"
            );
        }
        tracing::info!("Billing service initialized");

        Ok(Self::from_parts(
            config,
            Arc::new(PgWebhookEventStore::new(pool.clone())),
            Arc::new(PgAppointmentArchive::new(pool)),
            billing,
        ))
    }

    /// Assemble state from explicit collaborators
    pub fn from_parts(
        config: Config,
        events: Arc<dyn WebhookEventStore>,
        archive: Arc<dyn AppointmentArchive>,
        billing: BillingService,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let processor = WebhookProcessor::new(events.clone(), config.webhook_max_attempts);
        let reaper = StaleAppointmentReaper::new(archive, config.reaper);
        let dispatcher = Arc::new(WebhookDispatcher::new(billing.webhooks.clone()));

        tracing::info!(
            duplicate_policy = %config.duplicate_policy,
            max_attempts = config.webhook_max_attempts,
            "Webhook processing initialized"
        );

        Self {
            config: Arc::new(config),
            jwt_manager,
            events,
            processor,
            dispatcher,
            reaper,
            billing: Arc::new(billing),
        }
    }
}
