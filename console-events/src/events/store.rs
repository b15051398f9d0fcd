//! In-process event store with bounded history

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::pubsub::{deliver, EventFilter, Registration, Registrations};
use super::{Event, Publisher, Store, Subscriber};
use crate::error::Result;
use crate::identifiers::EntityIdentifiers;

const DEFAULT_HISTORY_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct StoreState {
    history: VecDeque<Event>,
    registrations: Registrations,
}

/// In-process event bus that keeps the most recent events for replay
///
/// Publishing appends to the history and snapshots the live subscribers under
/// one lock; subscribing with history snapshots the replay set and registers
/// the live subscriber under the same lock. Every event therefore lands
/// either in the replay or in the live stream of a subscription, never both.
#[derive(Debug)]
pub struct MemoryStore {
    capacity: usize,
    state: Mutex<StoreState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with the default history capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a store keeping at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Number of events currently retained
    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    /// Number of live subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.registrations.len()
    }
}

#[async_trait]
impl Subscriber for MemoryStore {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        names: Option<Vec<String>>,
        identifiers: Vec<EntityIdentifiers>,
        sink: mpsc::Sender<Event>,
    ) -> Result<()> {
        self.state.lock().await.registrations.register(Registration {
            filter: Arc::new(EventFilter::new(names, identifiers)),
            cancel,
            sink,
        });
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn subscribe_with_history(
        &self,
        cancel: CancellationToken,
        names: Option<Vec<String>>,
        identifiers: Vec<EntityIdentifiers>,
        after: Option<DateTime<Utc>>,
        tail: u32,
        sink: mpsc::Sender<Event>,
    ) -> Result<()> {
        let filter = Arc::new(EventFilter::new(names, identifiers));

        // Live events queue up here while the replay is being written, which
        // keeps replayed events ahead of live ones.
        let (live_tx, mut live_rx) = mpsc::channel(sink.max_capacity());

        let replay: Vec<Event> = {
            let mut state = self.state.lock().await;
            let mut replay: Vec<Event> = state
                .history
                .iter()
                .filter(|event| filter.matches(event))
                .filter(|event| after.is_none_or(|after| event.time >= after))
                .cloned()
                .collect();
            if tail > 0 && replay.len() > tail as usize {
                replay.drain(..replay.len() - tail as usize);
            }
            state.registrations.register(Registration {
                filter: filter.clone(),
                cancel: cancel.clone(),
                sink: live_tx,
            });
            replay
        };

        tracing::debug!(replay = replay.len(), tail, ?after, "Replaying history");

        for event in replay {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = sink.send(event) => {
                    if result.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = live_rx.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        result = sink.send(event) => {
                            if result.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Publisher for MemoryStore {
    async fn publish(&self, event: Event) {
        let targets = {
            let mut state = self.state.lock().await;
            state.history.push_back(event.clone());
            while state.history.len() > self.capacity {
                state.history.pop_front();
            }
            state.registrations.matching(&event)
        };
        deliver(targets, &event).await;
    }
}
