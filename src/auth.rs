//! Admin key check for the manager's operator routes.
//!
//! Agents authenticate on the tunnel connect handshake with their own token
//! (see [`crate::tunnel::server`]). Operator routes such as
//! `/api/tunnel/status` instead require `Authorization: Bearer <api_key>`.

use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected admin key, injected as a router extension for [`require_api_key`].
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Rejects requests without a matching bearer key.
///
/// - `401` when the header is missing or not a bearer token
/// - `403` when the key does not match
/// - `500` when no [`ApiKey`] extension is installed
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Byte comparison whose running time depends only on `expected`'s length.
///
/// Used for both the admin key and agent tokens.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
