//! HMAC signature middleware.
//!
//! With a key configured, a request carrying a signature header is checked
//! against its raw (still compressed) body, and every response body is
//! signed. Requests without the header pass through unchecked.

use crate::core::SigningKey;
use crate::wire;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Largest request or response body the middleware will buffer.
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

static SIGNATURE: HeaderName = HeaderName::from_static("hashsha256");

pub async fn signature(State(key): State<SigningKey>, request: Request, next: Next) -> Response {
    if key.is_empty() {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(_) => return (StatusCode::BAD_REQUEST, "unreadable request body").into_response(),
    };

    if let Some(provided) = parts.headers.get(&SIGNATURE) {
        let valid = provided
            .to_str()
            .map_or(false, |provided| wire::verify(&key, &body, provided));
        if !valid {
            tracing::warn!(uri = %parts.uri, "Rejected request with invalid signature");
            return (StatusCode::BAD_REQUEST, "invalid signature").into_response();
        }
    }

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;

    let (mut parts, body) = response.into_parts();
    let body = match to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Failed to buffer response body for signing");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        },
    };
    if let Ok(value) = HeaderValue::from_str(&wire::sign(&key, &body)) {
        parts.headers.insert(SIGNATURE.clone(), value);
    }
    Response::from_parts(parts, Body::from(body))
}
