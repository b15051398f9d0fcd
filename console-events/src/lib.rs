//! # console-events
//!
//! WebSocket gateway multiplexing filtered event streams to console clients.
//!
//! A console opens one WebSocket to [`websocket::EVENTS_PATH`] and multiplexes
//! any number of subscriptions over it. Each subscription names the entities
//! it wants events about and, optionally, event name patterns and history to
//! replay. Every event is checked against the caller's current rights before
//! it is forwarded.
//!
//! ## Features
//!
//! - **Multiplexed subscriptions**: client-chosen IDs, per-request errors
//! - **Rights-based visibility**: checked per event through a [`rights::RightsResolver`]
//! - **Backpressure**: single-slot channels end to end, nothing is dropped
//! - **Rate limiting**: per-principal message budget and per-credential upgrade budget
//! - **History replay**: `tail` and `after` against a [`events::Store`]
//! - **Graceful shutdown**: every connection closes normally on SIGTERM/SIGINT
//!
//! ## Example
//!
//! ```rust,no_run
//! use console_events::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let resolver = Arc::new(MemoryRightsResolver::new());
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let state = EventsState::builder()
//!         .config(config)
//!         .resolver(resolver)
//!         .store(store)
//!         .build()?;
//!
//!     Server::new(state).serve().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod identifiers;
pub mod middleware;
pub mod observability;
pub mod protocol;
pub mod rights;
pub mod server;
pub mod state;
pub mod websocket;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, EventsConfig, QuotaConfig, RateLimitConfig, ServiceConfig};
    pub use crate::error::{Error, ErrorDetails, Result};
    pub use crate::events::{
        Definition, Definitions, Event, MemoryPubSub, MemoryStore, Publisher, Store, Subscriber,
    };
    pub use crate::identifiers::EntityIdentifiers;
    pub use crate::middleware::{GovernorRateLimiter, RateLimiter};
    pub use crate::observability::init_tracing;
    pub use crate::protocol::{Request, Response as EventsResponse, SubscriptionId, PROTOCOL_V1};
    pub use crate::rights::{
        AuthInfo, Caller, Credentials, MemoryRightsResolver, Principal, Right, Rights,
        RightsResolver,
    };
    pub use crate::server::Server;
    pub use crate::state::{EventsState, EventsStateBuilder};
    pub use crate::websocket::{router, EVENTS_PATH};

    pub use axum::{
        extract::State,
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };
    pub use tokio;
    pub use tracing::{debug, error, info, warn};
}
