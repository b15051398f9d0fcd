//! Event model, definitions registry and in-process event bus
//!
//! This module holds everything the gateway needs to know about events
//! without importing any producer's types:
//!
//! - [`Event`]: a named occurrence about one or more entities, carrying the
//!   rights required to see it
//! - [`Definitions`]: the registry of known event names, used to expand
//!   subscription name patterns and to stamp events with their visibility
//! - [`Subscriber`] / [`Store`] / [`Publisher`]: the bus contracts the
//!   gateway consumes
//! - [`MemoryPubSub`] / [`MemoryStore`]: in-process implementations with
//!   back-pressured delivery, the latter with history replay

mod definitions;
mod event;
mod pubsub;
mod store;

pub use definitions::{Definition, Definitions};
pub use event::Event;
pub use pubsub::{EventFilter, MemoryPubSub, Publisher, Store, Subscriber};
pub use store::MemoryStore;
