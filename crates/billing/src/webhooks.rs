//! Mercado Pago webhook handling
//!
//! Notifications only carry the resource type and id. The handler re-reads
//! the resource from the processor, so a replayed or forged body cannot move
//! state on its own.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use medibook_shared::{
    EventHandler, HandlerError, NewWebhookEvent, PaymentStatus, PaymentTransition,
    WebhookEventRecord,
};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::notifications::AppointmentNotifier;
use crate::payments::PaymentService;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

pub const PAYMENT_EVENT: &str = "payment";
pub const PREAPPROVAL_EVENT: &str = "subscription_preapproval";

/// Verify the `x-signature` header of a Mercado Pago notification
///
/// The header looks like `ts=1704908010,v1=618c8534...`. The signed manifest
/// is `id:{data.id};request-id:{x-request-id};ts:{ts};`. Verification is
/// skipped when no secret is configured.
pub fn verify_signature(
    secret: Option<&str>,
    headers: &HeaderMap,
    data_id: Option<&str>,
) -> BillingResult<()> {
    let Some(secret) = secret else {
        tracing::debug!("No webhook secret configured, skipping signature check");
        return Ok(());
    };

    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing x-signature header");
            BillingError::WebhookSignatureInvalid
        })?;
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let mut timestamp: Option<&str> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "ts" => timestamp = Some(value),
                "v1" => v1_signature = Some(value),
                _ => {}
            }
        }
    }

    let (Some(timestamp), Some(v1_signature)) = (timestamp, v1_signature) else {
        tracing::warn!("Malformed x-signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    };

    let mut manifest = String::new();
    if let Some(data_id) = data_id {
        // Alphanumeric ids are signed in lower case
        manifest.push_str(&format!("id:{};", data_id.to_lowercase()));
    }
    if !request_id.is_empty() {
        manifest.push_str(&format!("request-id:{};", request_id));
    }
    manifest.push_str(&format!("ts:{};", timestamp));

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(manifest.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed.as_bytes().ct_eq(v1_signature.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!(request_id = %request_id, "Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

#[derive(Deserialize)]
struct NotificationData {
    #[serde(default, deserialize_with = "optional_remote_id")]
    id: Option<String>,
}

#[derive(Deserialize)]
struct Notification {
    #[serde(rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    date_created: Option<String>,
    #[serde(default)]
    data: Option<NotificationData>,
}

fn optional_remote_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    crate::client::deserialize_remote_id(deserializer).map(Some)
}

/// Parse a notification body into an event ready to be stored
pub fn parse_notification(body: &[u8]) -> BillingResult<NewWebhookEvent> {
    let raw: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| BillingError::InvalidPayload(format!("body is not JSON: {}", e)))?;

    let notification: Notification = serde_json::from_value(raw.clone())
        .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

    // Older IPN-style notifications use `topic` instead of `type`
    let event_type = notification
        .event_type
        .or(notification.topic)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BillingError::InvalidPayload("missing notification type".to_string()))?;

    let date_created = notification.date_created.as_deref().and_then(|d| {
        OffsetDateTime::parse(d, &time::format_description::well_known::Rfc3339).ok()
    });

    Ok(NewWebhookEvent {
        action: notification.action,
        api_version: notification.api_version,
        data_id: notification.data.and_then(|d| d.id),
        date_created,
        event_type,
        raw_data: raw,
    })
}

/// Applies stored Mercado Pago notifications to local state
#[derive(Clone)]
pub struct BillingWebhookHandler {
    payments: PaymentService,
    subscriptions: SubscriptionService,
    notifier: Arc<dyn AppointmentNotifier>,
}

impl BillingWebhookHandler {
    pub fn new(
        payments: PaymentService,
        subscriptions: SubscriptionService,
        notifier: Arc<dyn AppointmentNotifier>,
    ) -> Self {
        Self {
            payments,
            subscriptions,
            notifier,
        }
    }

    async fn handle_payment(&self, payment_id: &str) -> BillingResult<()> {
        let transition = self.payments.sync_from_processor(payment_id).await?;

        if let PaymentTransition::Applied { payment, .. } = transition {
            if payment.status == PaymentStatus::Approved {
                self.notify_confirmed(payment.appointment_id).await;
            }
        }

        Ok(())
    }

    /// Best effort: a failed notification never fails the event
    async fn notify_confirmed(&self, appointment_id: uuid::Uuid) {
        let contact = match self.payments.store().appointment_contact(appointment_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(appointment_id = %appointment_id, error = %e, "Could not load appointment contact");
                return;
            }
        };

        if let Err(e) = self.notifier.payment_confirmed(&contact).await {
            tracing::warn!(
                appointment_id = %appointment_id,
                error = %e,
                "Payment confirmation notification failed"
            );
        }
    }
}

fn classify(e: BillingError) -> HandlerError {
    if e.is_retryable() {
        HandlerError::Retryable(e.to_string())
    } else {
        HandlerError::Permanent(e.to_string())
    }
}

#[async_trait]
impl EventHandler for BillingWebhookHandler {
    async fn handle(&self, event: &WebhookEventRecord) -> Result<(), HandlerError> {
        let data_id = || {
            event
                .data_id
                .as_deref()
                .ok_or_else(|| HandlerError::Permanent("notification has no data.id".to_string()))
        };

        match event.event_type.as_str() {
            PAYMENT_EVENT => self.handle_payment(data_id()?).await.map_err(classify),
            PREAPPROVAL_EVENT => self
                .subscriptions
                .sync_from_processor(data_id()?)
                .await
                .map(|_| ())
                .map_err(classify),
            other => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %other,
                    "Unhandled Mercado Pago notification type, acknowledging"
                );
                Ok(())
            }
        }
    }
}
