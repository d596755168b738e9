//! Harness configuration.
//!
//! Read from the environment. Malformed values are logged and replaced by
//! their defaults rather than failing startup.

use std::time::Duration;

use tracing::warn;

use crate::retry::{Backoff, RetryPolicy};

pub const MAX_RETRIES_ENV: &str = "JOBWRIGHT_MAX_RETRIES";
pub const REFIRE_DELAY_ENV: &str = "JOBWRIGHT_REFIRE_DELAY_MS";

/// Refire limit when none is configured.
pub const DEFAULT_MAX_RETRIES: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Negative means unlimited.
    pub max_retries: i32,
    /// Fixed delay before each refire.
    pub refire_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            refire_delay: Duration::ZERO,
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_retries = parse_or_default(&lookup, MAX_RETRIES_ENV, defaults.max_retries);
        let delay_ms = parse_or_default(&lookup, REFIRE_DELAY_ENV, 0u64);
        Self {
            max_retries,
            refire_delay: Duration::from_millis(delay_ms),
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_backoff(Backoff::fixed(self.refire_delay))
    }
}

pub(crate) fn parse_or_default<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "invalid configuration value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = HarnessConfig::from_lookup(lookup(&[]));
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn reads_values() {
        let config = HarnessConfig::from_lookup(lookup(&[
            (MAX_RETRIES_ENV, "-1"),
            (REFIRE_DELAY_ENV, "250"),
        ]));
        assert_eq!(config.max_retries, -1);
        assert_eq!(config.refire_delay, Duration::from_millis(250));
        assert!(config.retry_policy().is_unlimited());
    }

    #[test]
    fn malformed_value_falls_back() {
        let config = HarnessConfig::from_lookup(lookup(&[(MAX_RETRIES_ENV, "lots")]));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }
}
