//! Gateway state shared across connections

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Definitions, Store, Subscriber};
use crate::middleware::rate_limit::{AcceptRateLimit, GovernorRateLimiter, RateLimiter};
use crate::rights::RightsResolver;
use crate::websocket::EventSources;

/// State shared by every connection of the gateway
///
/// Cloning is cheap; all collaborators are reference counted.
#[derive(Clone)]
pub struct EventsState {
    config: Arc<Config>,
    resolver: Arc<dyn RightsResolver>,
    subscriber: Arc<dyn Subscriber>,
    store: Option<Arc<dyn Store>>,
    definitions: Definitions,
    request_limiter: Arc<dyn RateLimiter>,
    accept_limiter: Arc<dyn RateLimiter>,
    shutdown: CancellationToken,
}

impl EventsState {
    /// Create a new state builder
    pub fn builder() -> EventsStateBuilder {
        EventsStateBuilder::new()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the rights resolver
    pub fn resolver(&self) -> &Arc<dyn RightsResolver> {
        &self.resolver
    }

    /// Get the event definitions
    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    /// Limiter charged for every inbound protocol message
    pub fn request_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.request_limiter
    }

    /// Middleware state for upgrade request limiting
    pub fn accept_rate_limit(&self) -> AcceptRateLimit {
        AcceptRateLimit::new(
            self.accept_limiter.clone(),
            self.config.events.rate_limit_resource_prefix.clone(),
        )
    }

    /// Event bus collaborators handed to each connection
    pub fn sources(&self) -> EventSources {
        EventSources {
            subscriber: self.subscriber.clone(),
            store: self.store.clone(),
            definitions: self.definitions.clone(),
        }
    }

    /// Token cancelled when the server shuts down
    ///
    /// Every connection context is a child of this token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Builder for [`EventsState`]
#[derive(Default)]
pub struct EventsStateBuilder {
    config: Option<Config>,
    resolver: Option<Arc<dyn RightsResolver>>,
    subscriber: Option<Arc<dyn Subscriber>>,
    store: Option<Arc<dyn Store>>,
    definitions: Option<Definitions>,
    request_limiter: Option<Arc<dyn RateLimiter>>,
    accept_limiter: Option<Arc<dyn RateLimiter>>,
    shutdown: Option<CancellationToken>,
}

impl EventsStateBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (defaults to [`Config::default`])
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the rights resolver
    pub fn resolver(mut self, resolver: Arc<dyn RightsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set a live-only event source
    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Set a history-capable event source
    ///
    /// The store also serves live subscriptions.
    pub fn store<S: Store + 'static>(mut self, store: Arc<S>) -> Self {
        self.subscriber = Some(store.clone());
        self.store = Some(store);
        self
    }

    /// Set the event definitions
    pub fn definitions(mut self, definitions: Definitions) -> Self {
        self.definitions = Some(definitions);
        self
    }

    /// Override the limiter for inbound protocol messages
    pub fn request_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.request_limiter = Some(limiter);
        self
    }

    /// Override the limiter for upgrade requests
    pub fn accept_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.accept_limiter = Some(limiter);
        self
    }

    /// Use an existing shutdown token
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the state
    ///
    /// Fails with `FailedPrecondition` without a rights resolver or an event
    /// source. Rate limiters default to governor limiters built from the
    /// configured quotas.
    pub fn build(self) -> Result<EventsState> {
        let config = self.config.unwrap_or_default();
        let resolver = self.resolver.ok_or_else(|| {
            Error::failed_precondition("no_rights_resolver", "a rights resolver is required")
        })?;
        let subscriber = self.subscriber.ok_or_else(|| {
            Error::failed_precondition("no_event_source", "an event subscriber is required")
        })?;

        let request_limiter = self.request_limiter.unwrap_or_else(|| {
            Arc::new(GovernorRateLimiter::new(config.rate_limit.requests.clone()))
        });
        let accept_limiter = self.accept_limiter.unwrap_or_else(|| {
            Arc::new(GovernorRateLimiter::new(config.rate_limit.accept.clone()))
        });

        tracing::debug!(history = self.store.is_some(), "Events state built");

        Ok(EventsState {
            config: Arc::new(config),
            resolver,
            subscriber,
            store: self.store,
            definitions: self.definitions.unwrap_or_default(),
            request_limiter,
            accept_limiter,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}
