//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use medibook_billing::BillingError;
use medibook_shared::StoreError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Database error: {0}")]
    Database(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotFound(message) => ApiError::NotFound(message),
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::InvalidPayload(message) => ApiError::BadRequest(message),
            BillingError::Http(_) | BillingError::Processor { .. } => {
                ApiError::BadGateway(e.to_string())
            }
            BillingError::Database(_) | BillingError::Config(_) | BillingError::Notification(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs
        let message = match &self {
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Internal server error".to_string()
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                "Internal server error".to_string()
            }
            ApiError::BadGateway(e) => {
                tracing::warn!(error = %e, "Payment processor error");
                "Payment processor unavailable".to_string()
            }
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::BadRequest(message) | ApiError::NotFound(message) => message.clone(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_status() {
        let cases = [
            (BillingError::NotFound("payment".into()), StatusCode::NOT_FOUND),
            (BillingError::WebhookSignatureInvalid, StatusCode::UNAUTHORIZED),
            (BillingError::InvalidPayload("type".into()), StatusCode::BAD_REQUEST),
            (
                BillingError::Processor {
                    status: 503,
                    message: "down".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (BillingError::Database("gone".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (BillingError::Config("token".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (billing, expected) in cases {
            assert_eq!(ApiError::from(billing).status(), expected);
        }
    }

    #[tokio::test]
    async fn test_internal_details_are_not_rendered() {
        let response = ApiError::Internal("connection string leaked".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["code"], 500);
    }
}
