//! The events WebSocket endpoint
//!
//! Each accepted connection runs four cooperating tasks around a
//! [`SubscriptionSet`]:
//!
//! ```text
//! socket ─► reader ─► requests ─► mux ─► responses ─► writer ─► socket
//!                                  ▲
//!          bus ─► filter ─► egress ┘            pinger ─► socket
//! ```
//!
//! Every channel holds a single message, so a slow client stalls its own
//! subscriptions and, through them, the bus. Nothing is dropped.

mod config;
mod connection;
mod context;
mod handler;
mod mux;
mod subscriptions;

pub use config::{is_safari, CompressionMode};
pub use connection::{jittered, serve_connection, Connection};
pub use context::{start_task, ConnectionContext, TaskExit};
pub use handler::{events_handler, router, EVENTS_PATH};
pub use mux::run_mux;
pub use subscriptions::{EventSources, SubscriptionEvent, SubscriptionSet};

// Re-export axum WebSocket types for convenience
pub use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
