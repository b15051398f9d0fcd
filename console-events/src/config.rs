//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: CONSOLE_EVENTS_, nested keys split on `__`)
//! 2. A TOML file (./config.toml, or an explicit path)
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CONSOLE_EVENTS_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Events gateway configuration
    #[serde(default)]
    pub events: EventsConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds (does not apply to upgraded connections)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Events gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Base interval between keepalive pings
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,

    /// Fractional jitter applied to each ping period
    #[serde(default = "default_ping_jitter")]
    pub ping_jitter: f64,

    /// Lower bound of the per-subscription ingress buffer
    #[serde(default = "default_buffer_floor")]
    pub subscription_buffer_floor: usize,

    /// Upper bound of the per-subscription ingress buffer
    #[serde(default = "default_buffer_ceiling")]
    pub subscription_buffer_ceiling: usize,

    /// Disable permessage-deflate for Safari user agents
    #[serde(default = "default_true")]
    pub disable_compression_for_safari: bool,

    /// Namespace for rate limit resource keys
    #[serde(default = "default_resource_prefix")]
    pub rate_limit_resource_prefix: String,
}

impl EventsConfig {
    /// Get the ping period as a Duration
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    /// Ingress buffer size for a subscription requesting `tail` historical events
    #[must_use]
    pub fn subscription_buffer(&self, tail: u32) -> usize {
        (tail as usize).clamp(
            self.subscription_buffer_floor,
            self.subscription_buffer_ceiling,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.ping_period_secs == 0 {
            return Err(Error::invalid_argument(
                "ping_period",
                "ping period must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.ping_jitter) {
            return Err(Error::invalid_argument(
                "ping_jitter",
                format!("ping jitter `{}` must be in [0, 1)", self.ping_jitter),
            ));
        }
        if self.subscription_buffer_floor == 0
            || self.subscription_buffer_ceiling < self.subscription_buffer_floor
        {
            return Err(Error::invalid_argument(
                "subscription_buffer",
                format!(
                    "subscription buffer bounds `{}..={}` are invalid",
                    self.subscription_buffer_floor, self.subscription_buffer_ceiling
                ),
            ));
        }
        Ok(())
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ping_period_secs: default_ping_period(),
            ping_jitter: default_ping_jitter(),
            subscription_buffer_floor: default_buffer_floor(),
            subscription_buffer_ceiling: default_buffer_ceiling(),
            disable_compression_for_safari: default_true(),
            rate_limit_resource_prefix: default_resource_prefix(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Quota for inbound protocol messages, per principal
    #[serde(default = "default_request_quota")]
    pub requests: QuotaConfig,

    /// Quota for WebSocket upgrade requests, per credential
    #[serde(default = "default_accept_quota")]
    pub accept: QuotaConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_request_quota(),
            accept: default_accept_quota(),
        }
    }
}

/// A single rate limit quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Enable this quota
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum requests per period (0 rejects everything)
    pub requests_per_period: u32,

    /// Time period in seconds
    #[serde(default = "default_quota_period")]
    pub period_secs: u64,

    /// Additional burst allowance
    #[serde(default)]
    pub burst_size: u32,
}

impl QuotaConfig {
    /// Create an enabled quota
    #[must_use]
    pub fn per_period(requests: u32, period: Duration) -> Self {
        Self {
            enabled: true,
            requests_per_period: requests,
            period_secs: period.as_secs().max(1),
            burst_size: 0,
        }
    }

    /// Create a quota that never limits
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::per_period(0, Duration::from_secs(1))
        }
    }

    /// Set burst size
    #[must_use]
    pub fn with_burst_size(mut self, burst: u32) -> Self {
        self.burst_size = burst;
        self
    }

    /// Get the period as a Duration
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

// Default value functions

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_ping_period() -> u64 {
    60
}

fn default_ping_jitter() -> f64 {
    0.1
}

fn default_buffer_floor() -> usize {
    8
}

fn default_buffer_ceiling() -> usize {
    1024
}

fn default_resource_prefix() -> String {
    "http:console:internal:events".to_string()
}

fn default_quota_period() -> u64 {
    60
}

fn default_request_quota() -> QuotaConfig {
    QuotaConfig::per_period(600, Duration::from_secs(60)).with_burst_size(60)
}

fn default_accept_quota() -> QuotaConfig {
    QuotaConfig::per_period(60, Duration::from_secs(60)).with_burst_size(10)
}

impl Config {
    /// Load configuration from ./config.toml (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific file
    ///
    /// A missing file is not an error; defaults and environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
        }

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.events.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "console-events".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
            },
            events: EventsConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
