//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

const SESSION_COOKIE: &str = "medibook_auth_token";

/// Authenticated user extracted from the session token
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub role: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::UNAUTHORIZED;
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidToken => "Invalid or expired token",
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(SESSION_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(String::from)
            })
        })
}

/// Extract bearer token from the Authorization header, falling back to the
/// session cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires a valid session. Runs before any handler reads
/// or writes state.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no session token");
        return AuthError::MissingAuth.into_response();
    };

    match state.jwt_manager.validate_access_token(&token) {
        Ok(claims) => {
            tracing::debug!(path = %path, user_id = %claims.sub, "require_auth: authenticated");
            request.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                email: claims.email,
                role: claims.role,
            });
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "require_auth: token rejected");
            AuthError::InvalidToken.into_response()
        }
    }
}
