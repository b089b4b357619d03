// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::float_cmp))]

//! MediBook Shared Module
//!
//! Domain models and persistence shared by the API server and the worker.
//!
//! ## Features
//!
//! - **Webhook Event Store**: Durable record of every inbound webhook call
//! - **Webhook Processor**: Claim, handle and settle stored events
//! - **Stale-Appointment Reaper**: Archive and delete unpaid pending appointments
//! - **Payments & Subscriptions**: Local projection of processor state
//! - **Memory Store**: In-process implementation of every store trait

pub mod db;
pub mod error;
pub mod events;
pub mod memory;
pub mod models;
pub mod payments;
pub mod processor;
pub mod reaper;
pub mod settings;
pub mod subscriptions;


// Error
pub use error::{StoreError, StoreResult};

// Database
pub use db::{create_migration_pool, create_pool, run_migrations};

// Events
pub use events::{
    CreatedEvent, DuplicatePolicy, NewWebhookEvent, PgWebhookEventStore, WebhookEventRecord,
    WebhookEventStore,
};

// Memory
pub use memory::MemoryStore;

// Models
pub use models::{
    Appointment, AppointmentContact, AppointmentHistory, AppointmentStatus, Payment,
    PaymentStatus, StatusChange, Subscription, SubscriptionStatus, UnknownStatus,
};

// Payments
pub use payments::{PaymentStore, PaymentTransition, PgPaymentStore, ProcessorPaymentUpdate};

// Processor
pub use processor::{
    BatchSummary, EventHandler, HandlerError, ProcessOutcome, SkipReason, WebhookProcessor,
    CLAIM_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
};

// Reaper
pub use reaper::{
    AppointmentArchive, PgAppointmentArchive, ReapResult, ReaperConfig, StaleAppointmentReaper,
};

// Settings
pub use settings::{JobSettings, SettingsError};

// Subscriptions
pub use subscriptions::{PgSubscriptionStore, SubscriptionStore};
