//! HTTP surface of the events endpoint

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    middleware::{from_fn, from_fn_with_state},
    response::Response,
    routing::get,
    Extension, Router,
};
use tracing::Instrument;
use uuid::Uuid;

use super::config::CompressionMode;
use super::connection::{serve_connection, Connection};
use super::context::ConnectionContext;
use crate::error::{Error, Result};
use crate::middleware::auth::{extract_credentials, subprotocol_authorization};
use crate::middleware::rate_limit::{AcceptRateLimit, ConnectionRateLimit};
use crate::middleware::request_tracking::namespace_span;
use crate::protocol::PROTOCOL_V1;
use crate::rights::{Caller, Credentials};
use crate::state::EventsState;

/// Path of the events endpoint
pub const EVENTS_PATH: &str = "/api/v3/console/internal/events/";

/// Router serving the events endpoint
///
/// Upgrade requests pass through, outermost first: the namespace span, the
/// subprotocol bearer rewrite, credential extraction and the accept rate
/// limit.
pub fn router(state: EventsState) -> Router {
    let accept = state.accept_rate_limit();
    Router::new()
        .route(EVENTS_PATH, get(events_handler))
        .layer(from_fn_with_state(accept, AcceptRateLimit::middleware))
        .layer(from_fn(extract_credentials))
        .layer(from_fn(subprotocol_authorization))
        .layer(from_fn(namespace_span))
        .with_state(state)
}

/// Upgrade an authenticated request to an events connection
///
/// The caller must authenticate before the upgrade; failures are answered
/// over plain HTTP.
pub async fn events_handler(
    State(state): State<EventsState>,
    credentials: Option<Extension<Credentials>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let Some(Extension(credentials)) = credentials else {
        return Err(Error::unauthenticated(
            "no_credentials",
            "no credentials in request",
        ));
    };
    let caller = Caller::new(credentials, state.resolver().clone());
    let auth_info = caller.auth_info().await?;

    let events = &state.config().events;
    let rate_limit = ConnectionRateLimit::new(
        state.request_limiter().clone(),
        &events.rate_limit_resource_prefix,
        &auth_info,
    )?;
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());
    let compression =
        CompressionMode::for_user_agent(user_agent, events.disable_compression_for_safari);

    let span = tracing::info_span!(
        "console_events_connection",
        connection_id = %Uuid::new_v4(),
        resource = rate_limit.resource(),
        %compression,
    );
    let connection = Connection {
        ctx: ConnectionContext::child_of(state.shutdown_token()),
        caller,
        rate_limit,
        sources: state.sources(),
        config: events.clone(),
    };

    Ok(ws
        .protocols([PROTOCOL_V1])
        .on_upgrade(move |socket| {
            async move {
                let cause = serve_connection(socket, connection).await;
                if cause.is_graceful() {
                    tracing::debug!(cause = %cause, "Connection closed");
                } else {
                    tracing::warn!(cause = %cause, name = cause.name(), "Connection terminated");
                }
            }
            .instrument(span)
        }))
}
