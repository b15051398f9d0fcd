//! Governor-based rate limiting
//!
//! Two limits guard the events endpoint:
//!
//! - [`AcceptRateLimit`]: an axum middleware limiting WebSocket upgrade
//!   requests, keyed by a fingerprint of the bearer token (or the peer
//!   address for anonymous requests)
//! - [`ConnectionRateLimit`]: a per-connection adapter the reader consults
//!   for every inbound protocol message, keyed by a stable principal
//!   attribute so callers behind a shared NAT do not share a budget
//!
//! Both consult a [`RateLimiter`], by default the in-memory
//! [`GovernorRateLimiter`] (GCRA).

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota,
};

use crate::config::QuotaConfig;
use crate::error::{Error, Result};
use crate::rights::{AuthInfo, Credentials, Principal};

/// Keys tracked before stale limiter state is pruned
const RETAIN_THRESHOLD: usize = 10_000;

/// Limit applied to a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDetails {
    /// Requests allowed per period
    pub limit: u32,
    /// Length of the period
    pub period: Duration,
    /// Time until the next request is allowed (when limited)
    pub retry_after: Option<Duration>,
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOutcome {
    /// Whether the request must be rejected
    pub limited: bool,
    /// Limit details
    pub details: RateLimitDetails,
}

/// Non-blocking rate limiter keyed by resource
pub trait RateLimiter: Send + Sync {
    /// Consume one request for `resource`
    fn rate_limit(&self, resource: &str) -> RateLimitOutcome;
}

/// In-memory keyed rate limiter
///
/// A quota of `requests_per_period` over `period_secs` replenishes one
/// request every `period / requests_per_period`, allowing bursts of up to
/// `requests_per_period + burst_size`. A zero-request quota rejects every
/// request; a disabled quota never limits.
pub struct GovernorRateLimiter {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
    quota: QuotaConfig,
}

impl std::fmt::Debug for GovernorRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernorRateLimiter")
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl GovernorRateLimiter {
    /// Create a limiter from a quota configuration
    pub fn new(quota: QuotaConfig) -> Self {
        let limiter = NonZeroU32::new(quota.requests_per_period).and_then(|requests| {
            let interval = quota.period() / requests.get();
            let burst = NonZeroU32::new(requests.get().saturating_add(quota.burst_size))
                .unwrap_or(requests);
            Quota::with_period(interval)
                .map(|q| q.allow_burst(burst))
                .map(governor::RateLimiter::keyed)
        });

        Self {
            limiter,
            clock: DefaultClock::default(),
            quota,
        }
    }

    fn details(&self, retry_after: Option<Duration>) -> RateLimitDetails {
        RateLimitDetails {
            limit: self.quota.requests_per_period,
            period: self.quota.period(),
            retry_after,
        }
    }
}

impl RateLimiter for GovernorRateLimiter {
    fn rate_limit(&self, resource: &str) -> RateLimitOutcome {
        if !self.quota.enabled {
            return RateLimitOutcome {
                limited: false,
                details: self.details(None),
            };
        }

        let Some(limiter) = &self.limiter else {
            return RateLimitOutcome {
                limited: true,
                details: self.details(Some(self.quota.period())),
            };
        };

        if limiter.len() > RETAIN_THRESHOLD {
            limiter.retain_recent();
        }

        match limiter.check_key(&resource.to_string()) {
            Ok(()) => RateLimitOutcome {
                limited: false,
                details: self.details(None),
            },
            Err(not_until) => RateLimitOutcome {
                limited: true,
                details: self.details(Some(not_until.wait_time_from(self.clock.now()))),
            },
        }
    }
}

fn exhausted(resource: &str, details: RateLimitDetails) -> Error {
    tracing::debug!(
        resource,
        limit = details.limit,
        period_secs = details.period.as_secs(),
        "Rate limit exceeded"
    );
    Error::resource_exhausted(
        "rate_limit_exceeded",
        format!(
            "rate limit of {} requests per {}s exceeded",
            details.limit,
            details.period.as_secs()
        ),
        details.retry_after,
    )
}

/// Rate limit of one WebSocket connection
///
/// The resource key derives from the authenticated principal:
/// `api-key:<id>`, `access-token:<id>` or `session-id:<id>`, namespaced by
/// the configured prefix. Gateway tokens have no place on this endpoint and
/// are rejected.
#[derive(Clone)]
pub struct ConnectionRateLimit {
    limiter: Arc<dyn RateLimiter>,
    resource: String,
}

impl std::fmt::Debug for ConnectionRateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRateLimit")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl ConnectionRateLimit {
    /// Create the adapter for an authenticated caller
    pub fn new(limiter: Arc<dyn RateLimiter>, prefix: &str, auth_info: &AuthInfo) -> Result<Self> {
        let key = match &auth_info.principal {
            Principal::ApiKey { id, .. } => format!("api-key:{id}"),
            Principal::AccessToken { id, .. } => format!("access-token:{id}"),
            Principal::UserSession { session_id, .. } => format!("session-id:{session_id}"),
            Principal::GatewayToken { .. } => {
                return Err(Error::internal(
                    "unknown_caller",
                    "caller of this kind cannot use the events endpoint",
                ))
            }
        };
        Ok(Self {
            limiter,
            resource: format!("{prefix}:{key}"),
        })
    }

    /// The rate limit resource key
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Consume one request; fails with `ResourceExhausted` when the budget is spent
    pub fn check(&self) -> Result<()> {
        let outcome = self.limiter.rate_limit(&self.resource);
        if outcome.limited {
            return Err(exhausted(&self.resource, outcome.details));
        }
        Ok(())
    }
}

/// Rate limit middleware for WebSocket upgrade requests
#[derive(Clone)]
pub struct AcceptRateLimit {
    limiter: Arc<dyn RateLimiter>,
    prefix: String,
}

impl AcceptRateLimit {
    /// Create the middleware state
    pub fn new(limiter: Arc<dyn RateLimiter>, prefix: impl Into<String>) -> Self {
        Self {
            limiter,
            prefix: prefix.into(),
        }
    }

    fn resource(&self, request: &Request<Body>) -> String {
        if let Some(credentials) = request.extensions().get::<Credentials>() {
            return format!("{}:accept:token:{}", self.prefix, credentials.fingerprint());
        }
        match request.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => format!("{}:accept:peer:{}", self.prefix, addr.ip()),
            None => format!("{}:accept:anonymous", self.prefix),
        }
    }

    /// Middleware function rejecting upgrades over budget with 429
    pub async fn middleware(
        State(rate_limit): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> std::result::Result<Response, Error> {
        let resource = rate_limit.resource(&request);
        let outcome = rate_limit.limiter.rate_limit(&resource);
        if outcome.limited {
            return Err(exhausted(&resource, outcome.details));
        }
        Ok(next.run(request).await)
    }
}
