//! Shared-key authentication
//!
//! Every route except the root and health check requires the configured
//! key in the `X-API-Key` header. A missing header is distinguished from a
//! wrong one so clients can tell misconfiguration from bad credentials.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::api::AppState;
use crate::error::AppError;

/// Header carrying the shared key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Paths reachable without a key
const EXEMPT_PATHS: [&str; 2] = ["/", "/health"];

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = &state.config.auth.api_key;
    if expected.is_empty() || EXEMPT_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    match request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        None => Err(AppError::Unauthorized("missing API key".to_string())),
        Some(provided) if provided != expected => {
            Err(AppError::Forbidden("invalid API key".to_string()))
        },
        Some(_) => Ok(next.run(request).await),
    }
}
