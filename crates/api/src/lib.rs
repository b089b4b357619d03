// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::float_cmp))]

//! MediBook API Library
//!
//! HTTP surface of the booking core: provider webhooks, payment status,
//! cron-triggered cleanup and premium subscription endpoints.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use dispatch::{WebhookDispatcher, WhatsAppEventHandler};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
