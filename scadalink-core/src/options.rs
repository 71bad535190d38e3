//! Connection configuration parsed from string properties
//!
//! Connections are configured with a string key/value map, typically loaded
//! from middleware configuration. Every duration-valued key falls back to the
//! base `timeout` when unset, unparsable, or non-positive, so a connection
//! with nothing but defaults is still fully specified.

use std::collections::HashMap;
use std::time::Duration;

/// Base timeout applied when the `timeout` property is absent
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default divisor for deriving the ping period from the session timeout
pub const DEFAULT_PING_FREQUENCY: u32 = 3;

/// Property keys understood by the runtime
pub mod keys {
    pub const TIMEOUT: &str = "timeout";
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    pub const MESSAGE_TIMEOUT: &str = "messageTimeout";
    pub const PING_PERIOD: &str = "pingPeriod";
    pub const PING_FREQUENCY: &str = "pingFrequency";
}

/// Connection properties with timeout fallback semantics
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    properties: HashMap<String, String>,
}

impl ConnectionOptions {
    /// Create options from a raw property map
    pub fn from_properties(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }

    /// Raw property access
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn millis(&self, key: &str) -> Option<u64> {
        self.properties
            .get(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .map(|v| v as u64)
    }

    /// Base session timeout: no traffic at all for this long is fatal
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.millis(keys::TIMEOUT).unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// Timeout for the socket connect, falls back to `timeout`
    pub fn connect_timeout(&self) -> Duration {
        self.millis(keys::CONNECT_TIMEOUT)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.timeout())
    }

    /// Per-request timeout for session negotiation and application requests,
    /// falls back to `timeout`
    pub fn message_timeout(&self) -> Duration {
        self.millis(keys::MESSAGE_TIMEOUT)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.timeout())
    }

    /// Divisor applied to `timeout` when no explicit ping period is set
    pub fn ping_frequency(&self) -> u32 {
        self.properties
            .get(keys::PING_FREQUENCY)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_PING_FREQUENCY)
    }

    /// Read-idle period after which a keepalive ping is sent
    ///
    /// Explicit `pingPeriod` wins; otherwise derived as
    /// `timeout / pingFrequency` so several pings fit into one session
    /// timeout window.
    pub fn ping_period(&self) -> Duration {
        self.millis(keys::PING_PERIOD)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.timeout() / self.ping_frequency())
    }
}
