//! Request tracing helpers
//!
//! Tags every request with the events namespace and keeps credentials out of
//! the HTTP trace output.

use axum::{body::Body, extract::Request, http::HeaderName, middleware::Next, response::Response};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tracing::Instrument;

use crate::error::ERROR_NAMESPACE;

/// Headers that carry credentials and must be masked in logs
///
/// `sec-websocket-protocol` can carry a bearer token before it is rewritten.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "sec-websocket-protocol"];

/// Create a sensitive headers layer
pub fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let headers = SENSITIVE_HEADERS
        .iter()
        .copied()
        .map(HeaderName::from_static)
        .collect::<Vec<_>>();

    SetSensitiveRequestHeadersLayer::new(headers)
}

/// Middleware running the request inside a span tagged with the events namespace
pub async fn namespace_span(request: Request<Body>, next: Next) -> Response {
    let span = tracing::info_span!(
        "console_events_request",
        namespace = ERROR_NAMESPACE,
        method = %request.method(),
        path = %request.uri().path(),
    );
    next.run(request).instrument(span).await
}
