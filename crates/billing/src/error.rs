//! Billing error types

use medibook_shared::StoreError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Mercado Pago request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mercado Pago returned {status}: {message}")]
    Processor { status: u16, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification failed: {0}")]
    Notification(String),
}

impl BillingError {
    /// Whether the same call may succeed if attempted again later
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Http(_) | BillingError::Database(_) => true,
            BillingError::Processor { status, .. } => *status >= 500 || *status == 429,
            BillingError::Notification(_) => true,
            BillingError::NotFound(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::InvalidPayload(_)
            | BillingError::Config(_) => false,
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(e: StoreError) -> Self {
        BillingError::Database(e.to_string())
    }
}
