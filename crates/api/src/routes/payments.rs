//! Payment status routes

use axum::{
    extract::{Path, State},
    Json,
};
use medibook_shared::Payment;
use serde::Serialize;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub status: String,
    pub payer_email: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub description: Option<String>,
    pub appointment_id: Uuid,
}

impl From<Payment> for PaymentStatusResponse {
    fn from(payment: Payment) -> Self {
        Self {
            status: payment.status.as_str().to_string(),
            payer_email: payment.payer_email,
            amount: payment.amount,
            currency: payment.currency,
            description: payment.description,
            appointment_id: payment.appointment_id,
        }
    }
}

/// `GET /payments/status/{id}`: `id` is the local payment id or the
/// processor's payment id
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PaymentStatusResponse>> {
    let payment = state.billing.payments.get_status(&id).await?;
    Ok(Json(payment.into()))
}
