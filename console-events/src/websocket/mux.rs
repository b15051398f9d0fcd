//! Dispatch between requests, subscriptions and responses
//!
//! The mux is the only task touching a connection's [`SubscriptionSet`]. It
//! serves one request or one event per turn, so the acknowledgement of a
//! subscribe always reaches the writer before any event of that
//! subscription.

use tokio::sync::mpsc;

use super::context::ConnectionContext;
use super::subscriptions::SubscriptionSet;
use crate::error::Result;
use crate::protocol::{Request, Response};
use crate::rights::Caller;

/// Run the mux until the connection is cancelled, then close all subscriptions
///
/// Per-request failures become `error` responses. A caller whose
/// authentication lapsed ends the connection with `PermissionDenied`.
pub async fn run_mux(
    ctx: ConnectionContext,
    caller: Caller,
    mut set: SubscriptionSet,
    mut requests: mpsc::Receiver<Request>,
    responses: mpsc::Sender<Response>,
) -> Result<()> {
    let result = mux(&ctx, &caller, &mut set, &mut requests, &responses).await;
    set.close().await;
    result
}

async fn mux(
    ctx: &ConnectionContext,
    caller: &Caller,
    set: &mut SubscriptionSet,
    requests: &mut mpsc::Receiver<Request>,
    responses: &mpsc::Sender<Response>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Err(ctx.err()),

            request = requests.recv() => {
                let Some(request) = request else {
                    return Err(ctx.err());
                };
                caller.require_authenticated().await?;
                let response = handle_request(set, request).await;
                ctx.send(responses, response).await?;
            }

            Some(delivered) = set.events().recv() => {
                match delivered.event.to_proto_json() {
                    Ok(event) => {
                        let response = Response::Publish {
                            id: delivered.id,
                            event,
                        };
                        ctx.send(responses, response).await?;
                    }
                    Err(err) => tracing::warn!(
                        subscription_id = delivered.id,
                        name = %delivered.event.name,
                        error = %err,
                        "Failed to marshal event"
                    ),
                }
            }
        }
    }
}

async fn handle_request(set: &mut SubscriptionSet, request: Request) -> Response {
    match request {
        Request::Subscribe {
            id,
            identifiers,
            tail,
            after,
            names,
        } => match set.subscribe(id, identifiers, after, tail, &names).await {
            Ok(()) => Response::Subscribe { id },
            Err(err) => {
                tracing::debug!(subscription_id = id, error = %err, "Subscribe failed");
                Response::error(id, &err)
            }
        },
        Request::Unsubscribe { id } => match set.unsubscribe(id).await {
            Ok(()) => Response::Unsubscribe { id },
            Err(err) => {
                tracing::debug!(subscription_id = id, error = %err, "Unsubscribe failed");
                Response::error(id, &err)
            }
        },
    }
}
