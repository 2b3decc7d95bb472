//! Keep-alive cache configuration.
//!
//! Values come from defaults, optionally overridden by environment variables
//! that are read once per process.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CacheError, Result};

/// Environment variable overriding the per-key idle connection cap.
pub const ENV_MAX_CONNECTIONS: &str = "KEEPALIVE_MAX_CONNECTIONS";
/// Environment variable overriding the base idle lifetime, in milliseconds.
pub const ENV_LIFETIME_MS: &str = "KEEPALIVE_LIFETIME_MS";

/// Default maximum number of idle connections kept per key.
pub const DEFAULT_MAX_IDLE_PER_KEY: usize = 5;
/// Default idle lifetime when the peer does not advertise a keep-alive timeout.
pub const DEFAULT_BASE_LIFETIME: Duration = Duration::from_millis(5000);

static GLOBAL: OnceLock<KeepAliveConfig> = OnceLock::new();

/// Configuration for the keep-alive cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Maximum number of idle connections kept per connection key.
    pub max_idle_per_key: usize,
    /// Idle lifetime used when the peer advertises no timeout. Also the reaper wake interval.
    #[serde(with = "millis")]
    pub base_lifetime: Duration,
    /// Upper bound on how long the reclaimer blocks waiting for a dead owner.
    #[serde(with = "millis")]
    pub reclaim_poll_interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: DEFAULT_MAX_IDLE_PER_KEY,
            base_lifetime: DEFAULT_BASE_LIFETIME,
            reclaim_poll_interval: DEFAULT_BASE_LIFETIME,
        }
    }
}

impl KeepAliveConfig {
    /// Builds a configuration from defaults plus environment overrides.
    ///
    /// Missing, unparsable, or non-positive values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(max) = lookup(ENV_MAX_CONNECTIONS).and_then(|v| positive(&v)) {
            debug!(max_idle_per_key = max, "keep-alive cap overridden from environment");
            config.max_idle_per_key = max as usize;
        }

        if let Some(ms) = lookup(ENV_LIFETIME_MS).and_then(|v| positive(&v)) {
            debug!(lifetime_ms = ms, "keep-alive lifetime overridden from environment");
            config.base_lifetime = Duration::from_millis(ms);
            config.reclaim_poll_interval = config.base_lifetime;
        }

        config
    }

    /// Returns the process-wide configuration, reading the environment on first use.
    pub fn global() -> &'static KeepAliveConfig {
        GLOBAL.get_or_init(Self::from_env)
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_idle_per_key == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "max_idle_per_key must be at least 1".to_string(),
            });
        }
        if self.base_lifetime.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "base_lifetime must be non-zero".to_string(),
            });
        }
        if self.reclaim_poll_interval.is_zero() {
            return Err(CacheError::InvalidConfig {
                reason: "reclaim_poll_interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn positive(raw: &str) -> Option<u64> {
    match raw.trim().parse::<i64>() {
        Ok(v) if v > 0 => Some(v as u64),
        _ => None,
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
