//! Middleware for the events endpoint: credentials, rate limiting and request tracking

pub mod auth;
pub mod rate_limit;
pub mod request_tracking;

pub use auth::{
    extract_credentials, extract_token, rewrite_subprotocol_authorization,
    subprotocol_authorization, AUTHORIZATION_PROTOCOL_PREFIX,
};
pub use rate_limit::{
    AcceptRateLimit, ConnectionRateLimit, GovernorRateLimiter, RateLimitDetails,
    RateLimitOutcome, RateLimiter,
};
pub use request_tracking::{namespace_span, sensitive_headers_layer, SENSITIVE_HEADERS};
