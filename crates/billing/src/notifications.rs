//! WhatsApp Cloud API notifications
//!
//! Outbound messages are best effort: callers log failures and move on.

use std::time::Duration;

use async_trait::async_trait;
use medibook_shared::AppointmentContact;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::client::REQUEST_TIMEOUT;
use crate::error::{BillingError, BillingResult};

pub const DEFAULT_API_URL: &str = "https://graph.facebook.com/v18.0";

/// Total attempts per message, including the first one
const SEND_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub token: String,
    pub phone_number_id: String,
    pub api_url: String,
}

impl WhatsAppConfig {
    /// Returns `None` when the token or phone number id is missing
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("WHATSAPP_TOKEN").ok().filter(|v| !v.is_empty())?;
        let phone_number_id = std::env::var("WHATSAPP_PHONE_NUMBER_ID")
            .ok()
            .filter(|v| !v.is_empty())?;
        let api_url = std::env::var("WHATSAPP_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Some(Self {
            token,
            phone_number_id,
            api_url,
        })
    }
}

#[async_trait]
pub trait AppointmentNotifier: Send + Sync {
    /// Tell the patient their appointment is paid and confirmed
    async fn payment_confirmed(&self, contact: &AppointmentContact) -> BillingResult<()>;
}

#[derive(Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct TextMessage<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: TextBody<'a>,
}

#[derive(Clone)]
pub struct WhatsAppNotifier {
    http: reqwest::Client,
    config: Option<WhatsAppConfig>,
    /// Upper bound for one message, retries included. Confirmations are sent
    /// from the webhook request path.
    deadline: Duration,
}

impl WhatsAppNotifier {
    pub fn new(config: Option<WhatsAppConfig>) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            config,
            deadline: REQUEST_TIMEOUT,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn from_env() -> BillingResult<Self> {
        let config = WhatsAppConfig::from_env();
        if config.is_none() {
            tracing::warn!("WhatsApp not configured, notifications disabled");
        }
        Self::new(config)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Send a plain text message, retrying transient failures
    pub async fn send_text(&self, to: &str, body: &str) -> BillingResult<()> {
        let Some(config) = &self.config else {
            tracing::warn!(to = %to, "WhatsApp not configured, message dropped");
            return Ok(());
        };

        let url = format!("{}/{}/messages", config.api_url, config.phone_number_id);
        let message = TextMessage {
            messaging_product: "whatsapp",
            to,
            kind: "text",
            text: TextBody { body },
        };

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(SEND_ATTEMPTS - 1);

        let http = &self.http;
        let url = url.as_str();
        let token = config.token.as_str();
        let message = &message;

        let send = Retry::spawn(strategy, move || async move {
            let response = http
                .post(url)
                .bearer_auth(token)
                .json(message)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                Ok::<(), BillingError>(())
            } else {
                let detail = response.text().await.unwrap_or_default();
                Err(BillingError::Notification(format!("HTTP {}: {}", status, detail)))
            }
        });

        let result = match tokio::time::timeout(self.deadline, send).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::Notification(format!(
                "timed out after {:?}",
                self.deadline
            ))),
        };
        result.map_err(|e| {
            tracing::error!(to = %to, error = %e, "Failed to send WhatsApp message");
            e
        })?;

        tracing::info!(to = %to, "WhatsApp message sent");
        Ok(())
    }
}

#[async_trait]
impl AppointmentNotifier for WhatsAppNotifier {
    async fn payment_confirmed(&self, contact: &AppointmentContact) -> BillingResult<()> {
        let Some(phone) = contact.phone.as_deref() else {
            tracing::debug!(
                appointment_id = %contact.appointment_id,
                "Patient has no phone number, skipping confirmation"
            );
            return Ok(());
        };

        self.send_text(phone, &confirmation_text(contact)).await
    }
}

fn format_date(date: OffsetDateTime) -> String {
    format!(
        "{:02}/{:02}/{} {:02}:{:02}",
        date.day(),
        u8::from(date.month()),
        date.year(),
        date.hour(),
        date.minute()
    )
}

pub(crate) fn confirmation_text(contact: &AppointmentContact) -> String {
    format!(
        "Hola {}, tu pago fue aprobado y tu turno con {} el {} está confirmado.",
        contact.patient_name,
        contact.doctor_name,
        format_date(contact.date)
    )
}
