//! Per-connection WebSocket settings

use std::fmt;

/// Compression mode of a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// No permessage-deflate
    Disabled,
    /// permessage-deflate with context takeover
    ContextTakeover,
}

impl CompressionMode {
    /// Pick the compression mode for a client
    ///
    /// Some Safari versions fail on compressed frames, so compression is off
    /// for Safari when `disable_for_safari` is set.
    #[must_use]
    pub fn for_user_agent(user_agent: Option<&str>, disable_for_safari: bool) -> Self {
        match user_agent {
            Some(ua) if disable_for_safari && is_safari(ua) => Self::Disabled,
            _ => Self::ContextTakeover,
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::ContextTakeover => f.write_str("context_takeover"),
        }
    }
}

/// Whether the user agent is Safari
///
/// Chromium-based browsers also advertise `Safari/`, so they are excluded.
#[must_use]
pub fn is_safari(user_agent: &str) -> bool {
    user_agent.contains("Safari/")
        && !["Chrome/", "Chromium/", "CriOS/", "Edg/", "OPR/"]
            .iter()
            .any(|token| user_agent.contains(token))
}
