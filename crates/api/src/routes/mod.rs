//! API routes

pub mod cron;
pub mod payments;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn create_router(state: AppState) -> Router {
    // Routes that require a session
    let protected_routes = Router::new()
        .route("/subscriptions/cancel", post(subscriptions::cancel_subscription))
        .route("/subscriptions/access", get(subscriptions::check_access))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Public routes (provider callbacks authenticate themselves)
    let public_routes = Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/whatsapp",
            get(webhooks::whatsapp_verify).post(webhooks::whatsapp_receive),
        )
        .route("/webhooks/mercadopago", post(webhooks::mercadopago_receive))
        .route("/payments/status/{id}", get(payments::get_payment_status))
        .route("/cron/cleanup", get(cron::cleanup_appointments));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
