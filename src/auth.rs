//! Bearer-key authentication for the control API.
//!
//! A single pre-shared key guards every endpoint except `/api/health`.
//! The expected key travels as an [`ApiKey`] request extension so the
//! middleware stays decoupled from `AppState`.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Extension type carrying the expected API key, injected as a router layer.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Axum middleware enforcing `Authorization: Bearer <key>`.
///
/// Responds `401` when no bearer token is present, `403` when the token is
/// wrong, and `500` when the [`ApiKey`] extension was never injected (a
/// wiring bug, not a client error).
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<ApiKey>().map(|k| k.0.clone()) else {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "API key not configured");
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token {
        None => reject(StatusCode::UNAUTHORIZED, "Bearer token required"),
        Some(token) if keys_match(expected.as_bytes(), token.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => reject(StatusCode::FORBIDDEN, "API key rejected"),
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

/// Constant-time key comparison.
///
/// The scan always covers every byte of the expected key, so response
/// timing reveals neither the key's length nor how much of a guess matched.
/// A missing byte compares against its own inversion, which can never be
/// equal.
fn keys_match(expected: &[u8], provided: &[u8]) -> bool {
    let mut mismatch = expected.len() ^ provided.len();
    for (i, &byte) in expected.iter().enumerate() {
        mismatch |= usize::from(byte ^ provided.get(i).copied().unwrap_or(!byte));
    }
    mismatch == 0
}
