//! The four tasks of a connection
//!
//! - reader: decodes requests, charges the rate limit, feeds the mux
//! - writer: encodes responses onto the socket
//! - mux: see [`run_mux`]
//! - pinger: sends keepalive pings on a jittered period
//!
//! Whichever task returns first cancels the connection context with its
//! result; the others observe the cancellation and return. The socket is
//! then closed with a normal closure.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};

use super::context::{start_task, ConnectionContext, TaskExit};
use super::mux::run_mux;
use super::subscriptions::{EventSources, SubscriptionSet};
use crate::config::EventsConfig;
use crate::error::{Error, Result};
use crate::middleware::rate_limit::ConnectionRateLimit;
use crate::protocol::{Request, Response};
use crate::rights::Caller;

/// Everything a connection needs besides its socket
#[derive(Clone)]
pub struct Connection {
    /// Connection context, usually a child of the server shutdown token
    pub ctx: ConnectionContext,
    /// The authenticated caller
    pub caller: Caller,
    /// Rate limit charged per inbound request
    pub rate_limit: ConnectionRateLimit,
    /// Event bus collaborators
    pub sources: EventSources,
    /// Gateway settings
    pub config: EventsConfig,
}

/// Base period with random jitter applied
///
/// The result lies within `period × (1 ± jitter)`.
pub fn jittered(period: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return period;
    }
    let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
    period.mul_f64(factor)
}

/// Serve a connection until any of its tasks stops
///
/// Returns the cause that ended the connection once all tasks are joined and
/// every subscription is closed.
pub async fn serve_connection<S>(socket: S, connection: Connection) -> Error
where
    S: Stream<Item = std::result::Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + Unpin
        + 'static,
{
    let Connection {
        ctx,
        caller,
        rate_limit,
        sources,
        config,
    } = connection;

    let (sink, stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let (requests_tx, requests_rx) = mpsc::channel(1);
    let (responses_tx, responses_rx) = mpsc::channel(1);
    let set = SubscriptionSet::new(ctx.clone(), caller.clone(), sources, config.clone());

    tracing::debug!("Connection opened");

    let tasks = [
        start_task(
            &ctx,
            "console_events_read",
            TaskExit::CancelConnection,
            read_requests(ctx.clone(), stream, rate_limit, requests_tx),
        ),
        start_task(
            &ctx,
            "console_events_write",
            TaskExit::CancelConnection,
            write_responses(ctx.clone(), sink.clone(), responses_rx),
        ),
        start_task(
            &ctx,
            "console_events_mux",
            TaskExit::CancelConnection,
            run_mux(ctx.clone(), caller, set, requests_rx, responses_tx),
        ),
        start_task(
            &ctx,
            "console_events_ping",
            TaskExit::CancelConnection,
            ping(ctx.clone(), sink.clone(), config.ping_period(), config.ping_jitter),
        ),
    ];
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Connection task did not complete");
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }));
    if let Err(e) = sink.lock().await.send(close).await {
        tracing::trace!(error = %e, "Failed to send close frame");
    }

    ctx.err()
}

async fn read_requests<S>(
    ctx: ConnectionContext,
    mut stream: S,
    rate_limit: ConnectionRateLimit,
    requests: mpsc::Sender<Request>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.err()),
            message = stream.next() => message,
        };

        let text = match message {
            None | Some(Ok(Message::Close(_))) => return Err(Error::ConnectionClosed),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => {
                return Err(Error::invalid_argument(
                    "message_format",
                    "binary messages are not supported",
                ))
            }
            Some(Err(e)) => {
                return Err(Error::unavailable(
                    "read_message",
                    format!("failed to read message: {e}"),
                ))
            }
        };

        let request = Request::decode(text.as_str())?;
        rate_limit.check()?;
        ctx.send(&requests, request).await?;
    }
}

async fn write_responses<S>(
    ctx: ConnectionContext,
    sink: Arc<Mutex<S>>,
    mut responses: mpsc::Receiver<Response>,
) -> Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.err()),
            response = responses.recv() => match response {
                Some(response) => response,
                None => return Err(ctx.err()),
            },
        };
        let text = response.encode()?;
        send_message(&ctx, &sink, Message::Text(text.into())).await?;
    }
}

async fn ping<S>(
    ctx: ConnectionContext,
    sink: Arc<Mutex<S>>,
    period: Duration,
    jitter: f64,
) -> Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.err()),
            _ = tokio::time::sleep(jittered(period, jitter)) => {}
        }
        send_message(&ctx, &sink, Message::Ping(Default::default())).await?;
    }
}

async fn send_message<S>(ctx: &ConnectionContext, sink: &Mutex<S>, message: Message) -> Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    tokio::select! {
        _ = ctx.cancelled() => Err(ctx.err()),
        result = async { sink.lock().await.send(message).await } => result.map_err(|e| {
            Error::unavailable("write_message", format!("failed to write message: {e}"))
        }),
    }
}
