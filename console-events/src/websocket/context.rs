//! Connection context and named task spawning
//!
//! A [`ConnectionContext`] is a cancellation token that remembers why it was
//! cancelled. The first task to stop records its cause; every other task
//! observes the cancellation and returns, and the accept path reports the
//! recorded cause once all tasks are joined.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{Error, Result};

/// Cancellable context shared by the tasks of one connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    token: CancellationToken,
    cause: Arc<OnceLock<Error>>,
}

impl ConnectionContext {
    /// Create a root context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that is cancelled when `parent` is
    ///
    /// Used to tie connections to server shutdown.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::default(),
        }
    }

    /// Cancel the context, recording `cause` unless a cause is already set
    pub fn cancel(&self, cause: Error) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// Whether the context is cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the context is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Why the context was cancelled
    ///
    /// `None` while the context is live. A context cancelled through its
    /// parent reports `Canceled`.
    pub fn cause(&self) -> Option<Error> {
        if !self.is_cancelled() {
            return None;
        }
        Some(self.err())
    }

    /// The cancellation cause, `Canceled` if none was recorded
    pub fn err(&self) -> Error {
        self.cause.get().cloned().unwrap_or(Error::Canceled)
    }

    /// A child token for per-subscription cancellation
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Send on a channel, giving up when the context is cancelled
    pub async fn send<T>(&self, tx: &mpsc::Sender<T>, value: T) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.err()),
            result = tx.send(value) => result.map_err(|_| self.err()),
        }
    }
}

/// What a finished task does to its connection
///
/// Tasks are never restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// Any return cancels the connection with the task's result
    CancelConnection,
    /// Only an error return cancels the connection
    CancelConnectionOnError,
    /// The result is logged and the connection is left alone
    Detached,
}

/// Start a named task bound to a connection context
///
/// The task runs in a span carrying its name. A panic is reported as an
/// internal error. Only the task that ends the connection logs its cause,
/// and a graceful cause (peer close, cancellation) is not logged as a
/// failure.
pub fn start_task<F>(
    ctx: &ConnectionContext,
    name: &'static str,
    exit: TaskExit,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    let span = tracing::debug_span!("task", name);
    tokio::spawn(
        async move {
            let result = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(Error::internal(
                        "task_panicked",
                        format!("task `{name}` panicked"),
                    ))
                });

            match &result {
                Ok(()) => tracing::trace!("Task finished"),
                Err(_) if ctx.is_cancelled() => tracing::trace!("Task stopped with connection"),
                Err(err) if err.is_graceful() => {
                    tracing::debug!(error = %err, "Task stopped");
                }
                Err(err) => tracing::warn!(error = %err, name = err.name(), "Task failed"),
            }
            match (exit, result) {
                (TaskExit::CancelConnection, Ok(())) => ctx.cancel(Error::Canceled),
                (TaskExit::CancelConnection | TaskExit::CancelConnectionOnError, Err(err)) => {
                    ctx.cancel(err)
                }
                _ => {}
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always() -> bool {
        true
    }

    #[tokio::test]
    async fn test_first_cause_wins() {
        let ctx = ConnectionContext::new();
        assert!(ctx.cause().is_none());

        ctx.cancel(Error::ConnectionClosed);
        ctx.cancel(Error::internal("late", "late"));

        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.cause(), Some(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = ConnectionContext::child_of(&parent);
        let sub = ctx.child_token();

        parent.cancel();
        assert!(ctx.is_cancelled());
        assert!(sub.is_cancelled());
        assert!(matches!(ctx.err(), Error::Canceled));
    }

    #[tokio::test]
    async fn test_subscription_token_does_not_cancel_connection() {
        let ctx = ConnectionContext::new();
        let sub = ctx.child_token();
        sub.cancel();
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_failing_task_cancels_connection() {
        let ctx = ConnectionContext::new();
        let handle = start_task(&ctx, "failing", TaskExit::CancelConnection, async {
            Err(Error::permission_denied("unauthenticated", "revoked"))
        });
        handle.await.unwrap();

        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.err(), Error::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_panicking_task_cancels_connection() {
        let ctx = ConnectionContext::new();
        start_task(&ctx, "panicking", TaskExit::CancelConnection, async {
            if always() {
                panic!("boom");
            }
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(ctx.err().name(), "task_panicked");
    }

    #[tokio::test]
    async fn test_send_gives_up_on_cancel() {
        let ctx = ConnectionContext::new();
        let (tx, _rx) = mpsc::channel(1);
        ctx.send(&tx, 1).await.unwrap();

        ctx.cancel(Error::ConnectionClosed);
        let err = ctx.send(&tx, 2).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_task_exit_policies() {
        let ctx = ConnectionContext::new();
        start_task(&ctx, "ok", TaskExit::CancelConnectionOnError, async { Ok(()) })
            .await
            .unwrap();
        start_task(&ctx, "detached", TaskExit::Detached, async {
            Err(Error::unavailable("store", "down"))
        })
        .await
        .unwrap();
        assert!(!ctx.is_cancelled());

        start_task(&ctx, "done", TaskExit::CancelConnection, async { Ok(()) })
            .await
            .unwrap();
        assert!(matches!(ctx.cause(), Some(Error::Canceled)));
    }
}
