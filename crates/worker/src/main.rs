//! MediBook Background Worker
//!
//! Handles scheduled jobs including:
//! - Stale pending appointment cleanup (every 5 minutes)
//! - Webhook event retries (every minute)
//! - Pending payment reconciliation with Mercado Pago (every 15 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use medibook_api::WebhookDispatcher;
use medibook_billing::BillingService;
use medibook_shared::{
    JobSettings, PgAppointmentArchive, PgWebhookEventStore, StaleAppointmentReaper,
    WebhookProcessor,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Unprocessed events picked up per webhook run
const WEBHOOK_BATCH_SIZE: i64 = 50;

/// Pending payments re-checked per reconciliation run
const PAYMENT_POLL_LIMIT: i64 = 50;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting MediBook Worker");

    // Same variables the API reads, so the cron endpoint and this schedule agree
    let settings = JobSettings::from_env()?;
    info!(settings = ?settings, "Job settings loaded");

    let pool = create_db_pool().await?;

    // Without Mercado Pago only the appointment cleanup runs
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Some(Arc::new(b)),
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - webhook and payment jobs disabled");
            None
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Archive and delete appointments left pending past the timeout
    let reaper = StaleAppointmentReaper::new(
        Arc::new(PgAppointmentArchive::new(pool.clone())),
        settings.reaper,
    );
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let reaper = reaper.clone();
            Box::pin(async move {
                match reaper.run().await {
                    Ok(result) => info!(processed = result.processed, "Stale appointment cleanup complete"),
                    Err(e) => error!(error = %e, "Stale appointment cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale appointment cleanup (every 5 minutes)");

    // Job 2: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    if let Some(billing) = billing {
        // Job 3: Retry stored webhook events that are still unprocessed
        let processor = WebhookProcessor::new(
            Arc::new(PgWebhookEventStore::new(pool.clone())),
            settings.webhook_max_attempts,
        );
        let dispatcher = Arc::new(WebhookDispatcher::new(billing.webhooks.clone()));
        scheduler
            .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
                let processor = processor.clone();
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    if let Err(e) = processor
                        .process_batch(WEBHOOK_BATCH_SIZE, dispatcher.as_ref())
                        .await
                    {
                        error!(error = %e, "Webhook batch failed");
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Webhook event retries (every minute)");

        // Job 4: Reconcile pending payments that have a processor id
        let payments = billing.payments.clone();
        scheduler
            .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                let payments = payments.clone();
                Box::pin(async move {
                    match payments.poll_pending(PAYMENT_POLL_LIMIT).await {
                        Ok(summary) => info!(
                            checked = summary.checked,
                            updated = summary.updated,
                            failed = summary.failed,
                            "Pending payment reconciliation complete"
                        ),
                        Err(e) => error!(error = %e, "Pending payment reconciliation failed"),
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Pending payment reconciliation (every 15 minutes)");
    }

    scheduler.start().await?;
    info!("Worker started, scheduler running");

    // Keep the process alive
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
