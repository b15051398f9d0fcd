//! Event bus contracts and the in-process pub/sub

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::Event;
use crate::error::Result;
use crate::identifiers::EntityIdentifiers;

/// Live event subscription
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver events matching `names` and `identifiers` into `sink` until
    /// `cancel` fires
    ///
    /// `names: None` matches every event name. Delivery is back-pressured: a
    /// full sink blocks the bus rather than dropping events.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        names: Option<Vec<String>>,
        identifiers: Vec<EntityIdentifiers>,
        sink: mpsc::Sender<Event>,
    ) -> Result<()>;
}

/// Event subscription with history replay
#[async_trait]
pub trait Store: Subscriber {
    /// Replay up to `tail` matching events that occurred at or after `after`,
    /// then stream live events, until `cancel` fires
    ///
    /// `tail == 0` replays every matching event at or after `after`. No event
    /// is delivered twice across the replay/live boundary. This future runs
    /// for the lifetime of the subscription.
    async fn subscribe_with_history(
        &self,
        cancel: CancellationToken,
        names: Option<Vec<String>>,
        identifiers: Vec<EntityIdentifiers>,
        after: Option<DateTime<Utc>>,
        tail: u32,
        sink: mpsc::Sender<Event>,
    ) -> Result<()>;
}

/// Event publication
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish an event to all matching subscribers
    async fn publish(&self, event: Event);
}

/// Name and identifier filter of one subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    names: Option<HashSet<String>>,
    identifiers: Vec<EntityIdentifiers>,
}

impl EventFilter {
    /// Create a filter; `names: None` matches every name, empty `identifiers`
    /// match every entity
    pub fn new(names: Option<Vec<String>>, identifiers: Vec<EntityIdentifiers>) -> Self {
        Self {
            names: names.map(|names| names.into_iter().collect()),
            identifiers,
        }
    }

    /// Whether the event passes the filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(names) = &self.names {
            if !names.contains(&event.name) {
                return false;
            }
        }
        if self.identifiers.is_empty() {
            return true;
        }
        self.identifiers
            .iter()
            .any(|sub| event.identifiers.iter().any(|ids| sub.covers(ids)))
    }
}

/// A registered subscriber
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub(crate) filter: Arc<EventFilter>,
    pub(crate) cancel: CancellationToken,
    pub(crate) sink: mpsc::Sender<Event>,
}

impl Registration {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sink.is_closed()
    }
}

/// Registry of live subscribers shared by the in-process bus implementations
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    entries: Vec<Registration>,
}

impl Registrations {
    pub(crate) fn register(&mut self, registration: Registration) {
        self.entries.retain(Registration::is_live);
        self.entries.push(registration);
    }

    /// Subscribers the event must be delivered to; prunes dead ones
    pub(crate) fn matching(&mut self, event: &Event) -> Vec<Registration> {
        self.entries.retain(Registration::is_live);
        self.entries
            .iter()
            .filter(|r| r.filter.matches(event))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&mut self) -> usize {
        self.entries.retain(Registration::is_live);
        self.entries.len()
    }
}

/// Deliver an event to each target in turn, blocking on full sinks
///
/// A target whose cancel token fires while blocked is skipped.
pub(crate) async fn deliver(targets: Vec<Registration>, event: &Event) {
    for target in targets {
        tokio::select! {
            _ = target.cancel.cancelled() => {}
            result = target.sink.send(event.clone()) => {
                if result.is_err() {
                    tracing::trace!(name = %event.name, "Subscriber sink closed during delivery");
                }
            }
        }
    }
}

/// In-process publish/subscribe bus without history
///
/// # Example
///
/// ```rust,ignore
/// let bus = Arc::new(MemoryPubSub::new());
/// let (tx, mut rx) = mpsc::channel(8);
/// bus.subscribe(cancel.clone(), None, vec![EntityIdentifiers::application("foo")], tx).await?;
/// bus.publish(definition.new_event(vec![EntityIdentifiers::application("foo")], None)).await;
/// let event = rx.recv().await;
/// ```
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    registrations: Mutex<Registrations>,
}

impl MemoryPubSub {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.registrations.lock().await.len()
    }
}

#[async_trait]
impl Subscriber for MemoryPubSub {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
        names: Option<Vec<String>>,
        identifiers: Vec<EntityIdentifiers>,
        sink: mpsc::Sender<Event>,
    ) -> Result<()> {
        self.registrations.lock().await.register(Registration {
            filter: Arc::new(EventFilter::new(names, identifiers)),
            cancel,
            sink,
        });
        Ok(())
    }
}

#[async_trait]
impl Publisher for MemoryPubSub {
    async fn publish(&self, event: Event) {
        let targets = self.registrations.lock().await.matching(&event);
        deliver(targets, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rights::Rights;
    use std::time::Duration;

    fn event(name: &str, ids: EntityIdentifiers) -> Event {
        Event::new(name, vec![ids], None, Rights::default())
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter::new(
            Some(vec!["as.up.data.forward".to_string()]),
            vec![EntityIdentifiers::application("foo")],
        );
        assert!(filter.matches(&event(
            "as.up.data.forward",
            EntityIdentifiers::device("foo", "dev1")
        )));
        assert!(!filter.matches(&event(
            "as.up.join.forward",
            EntityIdentifiers::application("foo")
        )));
        assert!(!filter.matches(&event(
            "as.up.data.forward",
            EntityIdentifiers::application("bar")
        )));
        assert!(EventFilter::default().matches(&event("x", EntityIdentifiers::gateway("gtw"))));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = MemoryPubSub::new();
        let cancel = CancellationToken::new();
        let (foo_tx, mut foo_rx) = mpsc::channel(4);
        let (bar_tx, mut bar_rx) = mpsc::channel(4);
        bus.subscribe(cancel.clone(), None, vec![EntityIdentifiers::application("foo")], foo_tx)
            .await
            .unwrap();
        bus.subscribe(cancel.clone(), None, vec![EntityIdentifiers::application("bar")], bar_tx)
            .await
            .unwrap();

        bus.publish(event("test", EntityIdentifiers::application("foo"))).await;

        assert_eq!(foo_rx.recv().await.unwrap().name, "test");
        assert!(bar_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_subscribers_are_pruned() {
        let bus = MemoryPubSub::new();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        bus.subscribe(cancel.clone(), None, vec![], tx).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 1);

        cancel.cancel();
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_sink_blocks_publisher() {
        let bus = Arc::new(MemoryPubSub::new());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        bus.subscribe(cancel.clone(), None, vec![], tx).await.unwrap();

        bus.publish(event("first", EntityIdentifiers::gateway("gtw"))).await;

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.publish(event("second", EntityIdentifiers::gateway("gtw"))).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        assert_eq!(rx.recv().await.unwrap().name, "first");
        publisher.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "second");
    }

    #[tokio::test]
    async fn test_cancel_unblocks_publisher() {
        let bus = Arc::new(MemoryPubSub::new());
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        bus.subscribe(cancel.clone(), None, vec![], tx).await.unwrap();
        bus.publish(event("first", EntityIdentifiers::gateway("gtw"))).await;

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.publish(event("second", EntityIdentifiers::gateway("gtw"))).await;
            })
        };
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .unwrap()
            .unwrap();
    }
}
