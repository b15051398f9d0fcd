//! Bearer credential extraction for the events endpoint
//!
//! Browsers cannot set custom headers on a WebSocket handshake, so the
//! console passes its token as a subprotocol entry instead:
//!
//! ```text
//! Sec-WebSocket-Protocol: ttn.lorawan.v3.header.authorization.bearer.<base64url token>, ttn.lorawan.v3.console.internal.events.v1
//! ```
//!
//! Entries that are not base64url, such as raw `NNSXS.` API keys, are taken
//! as the token verbatim.
//!
//! [`subprotocol_authorization`] rewrites that entry into a standard
//! `Authorization: Bearer` header and removes it from the offered
//! subprotocols; [`extract_credentials`] then stores the bearer as a
//! [`Credentials`] request extension for the handler and the accept rate
//! limiter.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};

use crate::rights::Credentials;

/// Subprotocol prefix carrying a bearer token
pub const AUTHORIZATION_PROTOCOL_PREFIX: &str = "ttn.lorawan.v3.header.authorization.bearer.";

/// Extract the bearer token from the Authorization header
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Decode a base64url subprotocol token, falling back to the raw entry
fn decode_token(encoded: &str) -> Option<String> {
    if encoded.is_empty() {
        return None;
    }
    let decoded = if encoded.ends_with('=') {
        URL_SAFE.decode(encoded)
    } else {
        URL_SAFE_NO_PAD.decode(encoded)
    };
    let token = decoded
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| encoded.to_string());
    Some(token)
}

/// Rewrite a bearer subprotocol entry into an Authorization header
///
/// Returns whether the headers were changed. An entry that is not valid
/// base64url is used as the raw token; an empty entry leaves the headers
/// untouched.
pub fn rewrite_subprotocol_authorization(headers: &mut HeaderMap) -> bool {
    let offered: Vec<String> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|protocol| protocol.trim().to_string())
        .filter(|protocol| !protocol.is_empty())
        .collect();

    let Some((index, token)) = offered.iter().enumerate().find_map(|(i, protocol)| {
        protocol
            .strip_prefix(AUTHORIZATION_PROTOCOL_PREFIX)
            .and_then(decode_token)
            .map(|token| (i, token))
    }) else {
        return false;
    };

    let Ok(authorization) = HeaderValue::from_str(&format!("Bearer {token}")) else {
        return false;
    };

    let remaining: Vec<&str> = offered
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, protocol)| protocol.as_str())
        .collect();

    headers.remove(header::SEC_WEBSOCKET_PROTOCOL);
    if !remaining.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&remaining.join(", ")) {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    headers.insert(header::AUTHORIZATION, authorization);
    true
}

/// Middleware translating the bearer subprotocol into an Authorization header
pub async fn subprotocol_authorization(mut request: Request<Body>, next: Next) -> Response {
    if rewrite_subprotocol_authorization(request.headers_mut()) {
        tracing::trace!("Rewrote subprotocol bearer into Authorization header");
    }
    next.run(request).await
}

/// Middleware storing the bearer token as a [`Credentials`] extension
pub async fn extract_credentials(mut request: Request<Body>, next: Next) -> Response {
    if let Some(token) = extract_token(request.headers()) {
        request.extensions_mut().insert(Credentials::bearer(token));
    }
    next.run(request).await
}
