//! Inbound webhook routes
//!
//! Every call is written to the event store before anything else happens, then
//! processed inline. Failed events stay queued for the worker to retry.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use medibook_billing::{parse_notification, verify_signature};
use medibook_shared::{NewWebhookEvent, ProcessOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dispatch::WHATSAPP_EVENT,
    error::ApiResult,
    state::AppState,
};

const WHATSAPP_OBJECT: &str = "whatsapp_business_account";

// =============================================================================
// WhatsApp
// =============================================================================

/// `GET /webhooks/whatsapp`: subscription handshake
pub async fn whatsapp_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge");

    let expected = state.config.whatsapp_verify_token.as_deref();

    match (mode, token, expected, challenge) {
        (Some("subscribe"), Some(token), Some(expected), Some(challenge)) if token == expected => {
            tracing::info!("WhatsApp webhook verified");
            (StatusCode::OK, challenge.clone()).into_response()
        }
        _ => {
            tracing::warn!(mode = ?mode, "WhatsApp webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhatsAppEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    changes: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppPayload {
    object: String,
    #[serde(default)]
    entry: Vec<WhatsAppEntry>,
}

/// Dedupe key for one change: the wamids it reports on. A status is keyed
/// with its state since one message moves through sent, delivered and read.
fn change_key(change: &serde_json::Value) -> Option<String> {
    let value = change.get("value")?;
    let statuses = value
        .get("statuses")
        .and_then(|s| s.as_array())
        .into_iter()
        .flatten()
        .filter_map(|s| {
            let id = s.get("id")?.as_str()?;
            let status = s.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
            Some(format!("{}:{}", id, status))
        });
    let messages = value
        .get("messages")
        .and_then(|m| m.as_array())
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("id")?.as_str().map(String::from));

    let keys: Vec<String> = statuses.chain(messages).collect();
    (!keys.is_empty()).then(|| keys.join(","))
}

/// `POST /webhooks/whatsapp`: delivery statuses and inbound messages
///
/// Every change is stored before any is processed. If a store write fails the
/// provider gets a 500 and re-delivers the whole body, so delivery is
/// at-least-once; the per-change wamid key lets the dedupe policy absorb the
/// changes that were already stored.
pub async fn whatsapp_receive(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: WhatsAppPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "Malformed WhatsApp webhook body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if payload.object != WHATSAPP_OBJECT {
        tracing::debug!(object = %payload.object, "Ignoring non-WhatsApp webhook object");
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut stored = Vec::new();
    for entry in payload.entry {
        for change in entry.changes {
            let key = change_key(&change);
            let mut event = NewWebhookEvent::new(WHATSAPP_EVENT, change);
            event.data_id = key;

            match store_event(&state, event).await {
                Ok(event_id) => stored.push(event_id),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        account_id = ?entry.id,
                        stored = stored.len(),
                        "Failed to record WhatsApp change"
                    );
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
    }

    // Stored events that fail here stay queued for the worker
    for event_id in stored {
        if let Err(e) = process_stored(&state, event_id).await {
            tracing::error!(event_id = %event_id, error = %e, "Failed to process WhatsApp change");
        }
    }

    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

// =============================================================================
// Mercado Pago
// =============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookReceipt {
    pub received: bool,
    pub event_id: Uuid,
    pub outcome: String,
}

/// `POST /webhooks/mercadopago`: payment and subscription notifications
pub async fn mercadopago_receive(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookReceipt>> {
    let parsed = parse_notification(&body);

    // The signed id is the one in the query string when present
    let data_id = params
        .get("data.id")
        .cloned()
        .or_else(|| parsed.as_ref().ok().and_then(|e| e.data_id.clone()));

    verify_signature(
        state.billing.webhook_secret(),
        &headers,
        data_id.as_deref(),
    )?;

    let mut event = parsed?;
    if event.data_id.is_none() {
        event.data_id = data_id;
    }

    let (event_id, outcome) = store_and_process(&state, event).await?;

    Ok(Json(WebhookReceipt {
        received: true,
        event_id,
        outcome: outcome.to_string(),
    }))
}

/// Persist the event, then process it unless an earlier delivery already
/// settled it
async fn store_and_process(
    state: &AppState,
    event: NewWebhookEvent,
) -> ApiResult<(Uuid, ProcessOutcome)> {
    let event_id = store_event(state, event).await?;
    let outcome = process_stored(state, event_id).await?;
    Ok((event_id, outcome))
}

async fn store_event(state: &AppState, event: NewWebhookEvent) -> ApiResult<Uuid> {
    let event_type = event.event_type.clone();
    let created = state
        .events
        .create_event(event, state.config.duplicate_policy)
        .await?;
    let event_id = created.record().id;

    tracing::info!(
        event_id = %event_id,
        event_type = %event_type,
        duplicate = created.is_duplicate(),
        "Webhook event stored"
    );

    Ok(event_id)
}

async fn process_stored(state: &AppState, event_id: Uuid) -> ApiResult<ProcessOutcome> {
    let outcome = state
        .processor
        .process_event(event_id, state.dispatcher.as_ref())
        .await?;

    match &outcome {
        ProcessOutcome::FailedWillRetry(error) => {
            tracing::warn!(event_id = %event_id, error = %error, "Webhook processing failed, will retry");
        }
        ProcessOutcome::FailedPermanent(error) => {
            tracing::error!(event_id = %event_id, error = %error, "Webhook processing failed permanently");
        }
        _ => {}
    }

    Ok(outcome)
}
