// =============================================================================
// Bearer-token authentication for the dashboard API
// =============================================================================
//
// The expected token comes from the `PULSEDESK_ADMIN_TOKEN` environment
// variable. Comparison runs in constant time. REST endpoints authenticate via
// the `Authorization: Bearer` header extractor; WebSocket upgrades pass the
// token as a `?token=` query parameter instead, since browsers cannot set
// headers on upgrade requests.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

const TOKEN_ENV: &str = "PULSEDESK_ADMIN_TOKEN";

/// Constant-time byte comparison; examines every byte regardless of where a
/// mismatch occurs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Validate a raw token string. Rejects everything when no token is
/// configured.
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

/// Axum extractor enforcing `Authorization: Bearer <token>`. Yields the raw
/// token for audit logging; rejects with 403 before the handler runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection(&'static str);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": self.0 })),
        )
            .into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) => token,
            None => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection("missing or invalid authorization token"));
            }
        };

        if !validate_token(token) {
            warn!("invalid admin token presented");
            return Err(AuthRejection("invalid authorization token"));
        }

        Ok(AuthBearer(token.to_string()))
    }
}
