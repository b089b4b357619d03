//! Cron-triggered maintenance routes

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;

use crate::{error::ApiError, state::AppState};

/// Compare the bearer token against the configured cron secret in constant
/// time. Open when no secret is configured.
fn authorize_cron(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = state.config.cron_secret.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if provided.as_bytes().ct_eq(secret.as_bytes()).into() {
        Ok(())
    } else {
        tracing::warn!("Cron request with invalid secret");
        Err(ApiError::Unauthorized)
    }
}

/// `GET /cron/cleanup`: archive and delete stale pending appointments
pub async fn cleanup_appointments(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize_cron(&state, &headers) {
        return e.into_response();
    }

    match state.reaper.run().await {
        Ok(result) => {
            let timestamp = result
                .timestamp
                .format(&Rfc3339)
                .unwrap_or_else(|_| result.timestamp.to_string());

            (
                StatusCode::OK,
                Json(json!({
                    "message": format!("Cleaned up {} stale appointments", result.processed),
                    "processed": result.processed,
                    "timestamp": timestamp,
                })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Failed to clean up appointments",
                "details": e.to_string(),
            })),
        )
            .into_response(),
    }
}
