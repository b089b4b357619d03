//! Premium subscription routes

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct CancelSubscriptionResponse {
    pub status: String,
    pub subscription_id: Uuid,
    pub preapproval_id: Option<String>,
}

/// `POST /subscriptions/cancel`: cancel at the processor, then locally
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CancelSubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel_subscription(auth_user.user_id)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        subscription_id = %subscription.id,
        "Subscription cancelled"
    );

    Ok(Json(CancelSubscriptionResponse {
        status: subscription.status.as_str().to_string(),
        subscription_id: subscription.id,
        preapproval_id: subscription.preapproval_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct AccessResponse {
    pub has_access: bool,
}

/// `GET /subscriptions/access`: premium content gate
pub async fn check_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<AccessResponse>> {
    let has_access = state
        .billing
        .subscriptions
        .has_premium_access(auth_user.user_id)
        .await?;

    Ok(Json(AccessResponse { has_access }))
}
