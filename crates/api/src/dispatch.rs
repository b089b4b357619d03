//! Routing of stored webhook events to their handlers

use async_trait::async_trait;
use medibook_billing::BillingWebhookHandler;
use medibook_shared::{EventHandler, HandlerError, WebhookEventRecord};
use serde::Deserialize;

/// Event type under which WhatsApp changes are stored
pub const WHATSAPP_EVENT: &str = "whatsapp";

#[derive(Debug, Deserialize)]
struct WhatsAppStatus {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    recipient_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMessage {
    #[serde(default)]
    from: Option<String>,
    #[serde(default, rename = "type")]
    message_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WhatsAppValue {
    #[serde(default)]
    statuses: Vec<WhatsAppStatus>,
    #[serde(default)]
    messages: Vec<WhatsAppMessage>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppChange {
    #[serde(default)]
    field: Option<String>,
    value: WhatsAppValue,
}

/// Records delivery statuses and inbound messages from WhatsApp
#[derive(Debug, Clone, Copy, Default)]
pub struct WhatsAppEventHandler;

#[async_trait]
impl EventHandler for WhatsAppEventHandler {
    async fn handle(&self, event: &WebhookEventRecord) -> Result<(), HandlerError> {
        let change: WhatsAppChange = serde_json::from_value(event.raw_data.clone())
            .map_err(|e| HandlerError::Permanent(format!("malformed WhatsApp change: {}", e)))?;

        for status in &change.value.statuses {
            tracing::info!(
                event_id = %event.id,
                message_id = status.id.as_deref().unwrap_or("unknown"),
                status = status.status.as_deref().unwrap_or("unknown"),
                recipient = status.recipient_id.as_deref().unwrap_or("unknown"),
                "WhatsApp message status"
            );
        }

        for message in &change.value.messages {
            tracing::info!(
                event_id = %event.id,
                from = message.from.as_deref().unwrap_or("unknown"),
                message_type = message.message_type.as_deref().unwrap_or("unknown"),
                "WhatsApp message received"
            );
        }

        if change.value.statuses.is_empty() && change.value.messages.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                field = change.field.as_deref().unwrap_or("unknown"),
                "WhatsApp change without statuses or messages"
            );
        }

        Ok(())
    }
}

/// Sends each event to the handler for its source
pub struct WebhookDispatcher {
    billing: BillingWebhookHandler,
    whatsapp: WhatsAppEventHandler,
}

impl WebhookDispatcher {
    pub fn new(billing: BillingWebhookHandler) -> Self {
        Self {
            billing,
            whatsapp: WhatsAppEventHandler,
        }
    }
}

#[async_trait]
impl EventHandler for WebhookDispatcher {
    async fn handle(&self, event: &WebhookEventRecord) -> Result<(), HandlerError> {
        match event.event_type.as_str() {
            WHATSAPP_EVENT => self.whatsapp.handle(event).await,
            _ => self.billing.handle(event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn record(raw_data: serde_json::Value) -> WebhookEventRecord {
        WebhookEventRecord {
            id: Uuid::new_v4(),
            action: None,
            api_version: None,
            data_id: None,
            date_created: None,
            event_type: WHATSAPP_EVENT.to_string(),
            raw_data,
            processed: false,
            claimed_at: None,
            attempts: 1,
            last_error: None,
            failed_at: None,
            processed_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_status_change_is_accepted() {
        let event = record(json!({
            "field": "messages",
            "value": {
                "statuses": [{"id": "wamid.1", "status": "delivered", "recipient_id": "5491100000000"}]
            }
        }));

        assert!(WhatsAppEventHandler.handle(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_change_is_accepted() {
        let event = record(json!({"field": "messages", "value": {}}));
        assert!(WhatsAppEventHandler.handle(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_change_is_permanent() {
        let event = record(json!({"field": "messages", "value": "not an object"}));

        let err = WhatsAppEventHandler.handle(&event).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
