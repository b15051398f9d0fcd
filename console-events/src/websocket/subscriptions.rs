//! Per-connection subscription set
//!
//! Each subscription owns a bounded ingress channel fed by the event bus and
//! a filter task that drops events the caller may not see and forwards the
//! rest, tagged with the subscription ID, to the connection's shared egress.
//! Both channels block when full, so a slow client back-pressures the bus
//! instead of losing events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::{start_task, ConnectionContext, TaskExit};
use crate::config::EventsConfig;
use crate::error::{Error, Result};
use crate::events::{Definitions, Event, Store, Subscriber};
use crate::identifiers::EntityIdentifiers;
use crate::protocol::SubscriptionId;
use crate::rights::Caller;

/// An event that passed a subscription's filter
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    /// Subscription the event was delivered to
    pub id: SubscriptionId,
    /// The event
    pub event: Event,
}

#[derive(Debug)]
struct Subscription {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    async fn close(self, id: SubscriptionId) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(subscription_id = id, error = %e, "Subscription task panicked");
            }
        }
    }
}

/// Event bus collaborators of a subscription set
#[derive(Clone)]
pub struct EventSources {
    /// Live event subscriber
    pub subscriber: Arc<dyn Subscriber>,
    /// Event store, when history replay is available
    pub store: Option<Arc<dyn Store>>,
    /// Registered event definitions
    pub definitions: Definitions,
}

/// The live subscriptions of one connection
///
/// Only the mux calls into the set; it is not shared between tasks.
pub struct SubscriptionSet {
    ctx: ConnectionContext,
    caller: Caller,
    sources: EventSources,
    config: EventsConfig,
    egress_tx: mpsc::Sender<SubscriptionEvent>,
    egress_rx: mpsc::Receiver<SubscriptionEvent>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionSet {
    /// Create an empty set for a connection
    pub fn new(
        ctx: ConnectionContext,
        caller: Caller,
        sources: EventSources,
        config: EventsConfig,
    ) -> Self {
        let (egress_tx, egress_rx) = mpsc::channel(1);
        Self {
            ctx,
            caller,
            sources,
            config,
            egress_tx,
            egress_rx,
            subscriptions: HashMap::new(),
        }
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the set has no subscriptions
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Whether a subscription with this ID is live
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    /// Open a subscription
    ///
    /// Fails without side effects when the ID is in use, the identifiers are
    /// empty or malformed, the caller has no rights on one of them, or a name
    /// pattern matches no registered event.
    pub async fn subscribe(
        &mut self,
        id: SubscriptionId,
        identifiers: Vec<EntityIdentifiers>,
        after: Option<DateTime<Utc>>,
        tail: u32,
        names: &[String],
    ) -> Result<()> {
        if self.subscriptions.contains_key(&id) {
            return Err(Error::already_exists(
                "already_subscribed",
                format!("already subscribed with ID `{id}`"),
            ));
        }
        if identifiers.is_empty() {
            return Err(Error::invalid_argument(
                "no_identifiers",
                "no identifiers to subscribe to",
            ));
        }
        for ids in &identifiers {
            ids.validate()?;
        }
        self.caller.require_any(&identifiers).await?;
        let names = self.sources.definitions.expand_patterns(names)?;

        let (ingress_tx, ingress_rx) = mpsc::channel(self.config.subscription_buffer(tail));
        let cancel = self.ctx.child_token();
        let mut tasks = Vec::with_capacity(2);

        match &self.sources.store {
            Some(store) => {
                let after = match (after, tail) {
                    (None, 0) => Some(Utc::now()),
                    (after, _) => after,
                };
                let store = store.clone();
                let cancel = cancel.clone();
                let identifiers = identifiers.clone();
                tasks.push(start_task(
                    &self.ctx,
                    "console_events_history",
                    TaskExit::Detached,
                    async move {
                        store
                            .subscribe_with_history(cancel, names, identifiers, after, tail, ingress_tx)
                            .await
                    },
                ));
            }
            None => {
                if let Err(err) = self
                    .sources
                    .subscriber
                    .subscribe(cancel.clone(), names, identifiers.clone(), ingress_tx)
                    .await
                {
                    cancel.cancel();
                    return Err(err);
                }
            }
        }

        tasks.push(start_task(
            &self.ctx,
            "console_events_subscription_filter",
            TaskExit::CancelConnectionOnError,
            filter_events(
                id,
                cancel.clone(),
                self.caller.clone(),
                self.sources.definitions.clone(),
                ingress_rx,
                self.egress_tx.clone(),
            ),
        ));

        tracing::debug!(
            subscription_id = id,
            identifiers = identifiers.len(),
            tail,
            ?after,
            "Subscribed"
        );
        self.subscriptions.insert(id, Subscription { cancel, tasks });
        Ok(())
    }

    /// Close a subscription and wait for its tasks
    ///
    /// Events of the subscription already in the egress are still delivered.
    pub async fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        let subscription = self.subscriptions.remove(&id).ok_or_else(|| {
            Error::not_found("not_subscribed", format!("not subscribed with ID `{id}`"))
        })?;
        subscription.close(id).await;
        tracing::debug!(subscription_id = id, "Unsubscribed");
        Ok(())
    }

    /// The shared egress of all subscriptions
    pub fn events(&mut self) -> &mut mpsc::Receiver<SubscriptionEvent> {
        &mut self.egress_rx
    }

    /// Close all subscriptions and wait for their tasks
    pub async fn close(&mut self) {
        for (id, subscription) in self.subscriptions.drain() {
            subscription.close(id).await;
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        for subscription in self.subscriptions.values() {
            subscription.cancel.cancel();
        }
    }
}

async fn filter_events(
    id: SubscriptionId,
    cancel: CancellationToken,
    caller: Caller,
    definitions: Definitions,
    mut ingress: mpsc::Receiver<Event>,
    egress: mpsc::Sender<SubscriptionEvent>,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            event = ingress.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };

        match caller.event_is_visible(&event, &definitions).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) if err.is_rights_denial() => return Err(err),
            Err(err) => {
                tracing::warn!(
                    subscription_id = id,
                    name = %event.name,
                    error = %err,
                    "Failed to check event visibility"
                );
                continue;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = egress.send(SubscriptionEvent { id, event }) => {
                if result.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryPubSub, MemoryStore, Publisher};
    use crate::identifiers::UserIdentifiers;
    use crate::rights::{
        Credentials, MemoryRightsResolver, Principal, Right, Rights, RightsResolver,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TOKEN: &str = "token";

    struct Fixture {
        resolver: Arc<MemoryRightsResolver>,
        bus: Arc<MemoryPubSub>,
        definitions: Definitions,
        ctx: ConnectionContext,
        set: SubscriptionSet,
    }

    fn fixture() -> Fixture {
        let resolver = Arc::new(MemoryRightsResolver::new());
        resolver.register(
            TOKEN,
            Principal::UserSession {
                session_id: "session".to_string(),
                user_ids: UserIdentifiers {
                    user_id: "admin".to_string(),
                    email: None,
                },
            },
        );
        resolver.grant(
            TOKEN,
            &EntityIdentifiers::application("foo"),
            Rights::new([Right::RightAll]),
        );

        let definitions = Definitions::new();
        definitions.define("foo", "foo happened", Rights::new([Right::RightApplicationDevicesRead]));
        definitions.define("bar", "bar happened", Rights::default());

        let bus = Arc::new(MemoryPubSub::new());
        let ctx = ConnectionContext::new();
        let set = SubscriptionSet::new(
            ctx.clone(),
            Caller::new(Credentials::bearer(TOKEN), resolver.clone()),
            EventSources {
                subscriber: bus.clone(),
                store: None,
                definitions: definitions.clone(),
            },
            EventsConfig::default(),
        );
        Fixture {
            resolver,
            bus,
            definitions,
            ctx,
            set,
        }
    }

    fn foo() -> Vec<EntityIdentifiers> {
        vec![EntityIdentifiers::application("foo")]
    }

    async fn next_event(set: &mut SubscriptionSet) -> SubscriptionEvent {
        tokio::time::timeout(Duration::from_secs(1), set.events().recv())
            .await
            .expect("event within timeout")
            .expect("egress open")
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let mut f = fixture();
        f.set.subscribe(42, foo(), None, 0, &[]).await.unwrap();
        assert!(f.set.contains(42));

        let definition = f.definitions.lookup("foo").unwrap();
        f.bus.publish(definition.new_event(foo(), None)).await;

        let delivered = next_event(&mut f.set).await;
        assert_eq!(delivered.id, 42);
        assert_eq!(delivered.event.name, "foo");
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_ids() {
        let mut f = fixture();
        f.set.subscribe(42, foo(), None, 0, &[]).await.unwrap();

        let err = f.set.subscribe(42, foo(), None, 0, &[]).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(err.to_string(), "already subscribed with ID `42`");

        f.set.unsubscribe(42).await.unwrap();
        assert!(f.set.is_empty());

        let err = f.set.unsubscribe(42).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        // The ID is free again
        f.set.subscribe(42, foo(), None, 0, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let mut f = fixture();

        let err = f.set.subscribe(1, vec![], None, 0, &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let err = f
            .set
            .subscribe(1, vec![EntityIdentifiers::application("Not Valid")], None, 0, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let err = f
            .set
            .subscribe(1, vec![EntityIdentifiers::application("bar")], None, 0, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));

        let err = f
            .set
            .subscribe(1, foo(), None, 0, &["unknown".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.name(), "unknown_event_name");

        assert!(f.set.is_empty());
        assert_eq!(f.bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_invisible_events_are_dropped() {
        let mut f = fixture();
        f.set.subscribe(1, foo(), None, 0, &[]).await.unwrap();
        let definition = f.definitions.lookup("foo").unwrap();
        f.bus
            .publish(definition.new_event(vec![EntityIdentifiers::application("bar")], None))
            .await;
        f.bus
            .publish(definition.new_event(vec![EntityIdentifiers::device("foo", "dev1")], None))
            .await;

        let delivered = next_event(&mut f.set).await;
        assert_eq!(
            delivered.event.identifiers,
            vec![EntityIdentifiers::device("foo", "dev1")]
        );
    }

    #[tokio::test]
    async fn test_unstamped_events_use_registered_visibility() {
        let mut f = fixture();
        let baz = vec![EntityIdentifiers::application("baz")];
        f.resolver
            .grant(TOKEN, &baz[0], Rights::new([Right::RightApplicationInfo]));
        f.set.subscribe(1, baz.clone(), None, 0, &[]).await.unwrap();

        // "foo" requires devices read, whatever the producer stamped
        f.bus
            .publish(Event::new("foo", baz.clone(), None, Rights::default()))
            .await;
        let definition = f.definitions.lookup("bar").unwrap();
        f.bus.publish(definition.new_event(baz.clone(), None)).await;

        let delivered = next_event(&mut f.set).await;
        assert_eq!(delivered.event.name, "bar");
        assert!(f.set.events().try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_upstream() {
        let mut f = fixture();
        f.set.subscribe(7, foo(), None, 0, &[]).await.unwrap();
        assert_eq!(f.bus.subscriber_count().await, 1);

        f.set.unsubscribe(7).await.unwrap();
        assert_eq!(f.bus.subscriber_count().await, 0);

        let definition = f.definitions.lookup("bar").unwrap();
        f.bus.publish(definition.new_event(foo(), None)).await;
        assert!(f.set.events().try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_cancels_everything() {
        let mut f = fixture();
        f.set.subscribe(1, foo(), None, 0, &[]).await.unwrap();
        f.set.subscribe(2, foo(), None, 0, &[]).await.unwrap();

        f.set.close().await;
        assert!(f.set.is_empty());
        assert_eq!(f.bus.subscriber_count().await, 0);
        assert!(!f.ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_revoked_rights_cancel_connection() {
        let mut f = fixture();
        f.set.subscribe(1, foo(), None, 0, &[]).await.unwrap();

        f.resolver.revoke(TOKEN);
        let definition = f.definitions.lookup("foo").unwrap();
        f.bus.publish(definition.new_event(foo(), None)).await;

        tokio::time::timeout(Duration::from_secs(1), f.ctx.cancelled())
            .await
            .unwrap();
        assert!(f.ctx.err().is_rights_denial());
    }

    struct FlakyResolver {
        inner: MemoryRightsResolver,
    }

    #[async_trait]
    impl RightsResolver for FlakyResolver {
        async fn auth_info(&self, credentials: &Credentials) -> Result<crate::rights::AuthInfo> {
            self.inner.auth_info(credentials).await
        }

        async fn entity_rights(
            &self,
            credentials: &Credentials,
            ids: &EntityIdentifiers,
        ) -> Result<Rights> {
            if ids.id_string() == "flaky" {
                return Err(Error::unavailable("rights_store", "rights store unavailable"));
            }
            self.inner.entity_rights(credentials, ids).await
        }
    }

    #[tokio::test]
    async fn test_visibility_infrastructure_errors_are_swallowed() {
        let resolver = FlakyResolver {
            inner: MemoryRightsResolver::new(),
        };
        resolver.inner.register(
            TOKEN,
            Principal::UserSession {
                session_id: "session".to_string(),
                user_ids: UserIdentifiers {
                    user_id: "admin".to_string(),
                    email: None,
                },
            },
        );
        resolver
            .inner
            .grant_universal(TOKEN, Rights::new([Right::RightAll]));

        let definitions = Definitions::new();
        definitions.define("foo", "foo happened", Rights::default());
        let bus = Arc::new(MemoryPubSub::new());
        let ctx = ConnectionContext::new();
        let mut set = SubscriptionSet::new(
            ctx.clone(),
            Caller::new(Credentials::bearer(TOKEN), Arc::new(resolver)),
            EventSources {
                subscriber: bus.clone(),
                store: None,
                definitions: definitions.clone(),
            },
            EventsConfig::default(),
        );
        set.subscribe(1, foo(), None, 0, &[]).await.unwrap();

        let definition = definitions.lookup("foo").unwrap();
        let mut flaky_event = definition.new_event(foo(), None);
        flaky_event.identifiers.push(EntityIdentifiers::application("flaky"));
        flaky_event.identifiers.reverse();
        bus.publish(flaky_event).await;
        bus.publish(definition.new_event(foo(), None)).await;

        let delivered = next_event(&mut set).await;
        assert_eq!(delivered.event.identifiers, foo());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_history_replay_through_store() {
        let f = fixture();
        let store = Arc::new(MemoryStore::new());
        let definition = f.definitions.lookup("foo").unwrap();
        for _ in 0..3 {
            store.publish(definition.new_event(foo(), None)).await;
        }

        let mut set = SubscriptionSet::new(
            f.ctx.clone(),
            Caller::new(Credentials::bearer(TOKEN), f.resolver.clone()),
            EventSources {
                subscriber: store.clone(),
                store: Some(store.clone()),
                definitions: f.definitions.clone(),
            },
            EventsConfig::default(),
        );
        set.subscribe(5, foo(), None, 2, &[]).await.unwrap();

        let first = next_event(&mut set).await;
        let second = next_event(&mut set).await;
        assert_eq!((first.id, second.id), (5, 5));
        assert!(set.events().try_recv().is_err());

        set.close().await;
    }

    #[tokio::test]
    async fn test_tail_zero_without_after_is_live_only() {
        let f = fixture();
        let store = Arc::new(MemoryStore::new());
        let definition = f.definitions.lookup("foo").unwrap();
        store.publish(definition.new_event(foo(), None)).await;

        let mut set = SubscriptionSet::new(
            f.ctx.clone(),
            Caller::new(Credentials::bearer(TOKEN), f.resolver.clone()),
            EventSources {
                subscriber: store.clone(),
                store: Some(store.clone()),
                definitions: f.definitions.clone(),
            },
            EventsConfig::default(),
        );
        set.subscribe(5, foo(), None, 0, &[]).await.unwrap();

        while store.subscriber_count().await == 0 {
            tokio::task::yield_now().await;
        }
        store.publish(definition.new_event(foo(), None).with_origin("live")).await;

        let delivered = next_event(&mut set).await;
        assert_eq!(delivered.event.origin, "live");
        set.close().await;
    }

    #[tokio::test]
    async fn test_backpressure_without_loss() {
        const EVENTS: usize = 2000;

        let mut f = fixture();
        f.set.subscribe(1, foo(), None, 0, &[]).await.unwrap();

        let definition = f.definitions.lookup("foo").unwrap();
        let published = Arc::new(AtomicUsize::new(0));
        let publisher = {
            let bus = f.bus.clone();
            let published = published.clone();
            tokio::spawn(async move {
                for i in 0..EVENTS {
                    bus.publish(definition.new_event(foo(), None).with_origin(i.to_string()))
                        .await;
                    published.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Nobody drains the egress: the ingress buffer fills and the bus blocks.
        // Beyond the ingress, one event sits in the egress slot and one is
        // held by the filter task waiting for it.
        let buffer = EventsConfig::default().subscription_buffer(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stalled = published.load(Ordering::SeqCst);
        assert!(
            (buffer..=buffer + 2).contains(&stalled),
            "publisher stalled after {stalled} events"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(published.load(Ordering::SeqCst), stalled);
        assert!(!publisher.is_finished());
        assert_eq!(f.bus.subscriber_count().await, 1);

        for i in 0..EVENTS {
            let delivered = next_event(&mut f.set).await;
            assert_eq!(delivered.event.origin, i.to_string());
        }
        publisher.await.unwrap();
        assert!(f.set.events().try_recv().is_err());
    }
}
