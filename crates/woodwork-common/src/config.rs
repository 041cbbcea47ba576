//! Runtime configuration model.
//!
//! [`RuntimeConfig`] carries the knobs that are not part of the component
//! graph itself: lifecycle fan-out, the exit token, and the message bus
//! delivery policy. Bus settings may also come from a `message_bus`
//! declaration in the configuration file.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_EXIT_TOKEN, DEFAULT_WORKERS, ENV_EXIT_TOKEN, ENV_MODE, ENV_WORKERS};
use crate::error::{Result, WoodworkError};

/// Which orchestration backend drives the running components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// Synchronous input -> processors -> outputs chain.
    Sequential,
    /// Asynchronous publish/subscribe bus.
    MessageBus,
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::MessageBus => write!(f, "message_bus"),
        }
    }
}

impl FromStr for OrchestrationMode {
    type Err = WoodworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "message_bus" | "bus" => Ok(Self::MessageBus),
            other => Err(WoodworkError::Config {
                message: format!("unknown orchestration mode: {other}"),
            }),
        }
    }
}

/// Delivery, retry and cleanup policy of the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Total delivery attempts per subscriber before dead-lettering.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_delay_ms: u64,
    /// Growth factor applied to the delay after each failed retry.
    pub backoff_multiplier: f64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Period of the retry processor, in milliseconds.
    pub retry_interval_ms: u64,
    /// Period of the cleanup task, in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Age after which an unconsumed or finished stream buffer is reclaimed.
    pub stream_ttl_ms: u64,
    /// Age after which a pending retry entry is considered stale.
    pub retry_ttl_ms: u64,
    /// Chunks buffered per stream before the producer waits.
    pub stream_capacity: usize,
    /// Events buffered per subscriber before emitters wait.
    pub queue_capacity: usize,
    /// Time given to in-flight work to settle on shutdown.
    pub shutdown_grace_ms: u64,
    /// Most recent dead letters kept for inspection.
    pub dead_letter_capacity: usize,
    /// Name of the component the main loop reads from.
    pub input: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 5_000,
            retry_interval_ms: 50,
            cleanup_interval_ms: 1_000,
            stream_ttl_ms: 60_000,
            retry_ttl_ms: 300_000,
            stream_capacity: 64,
            queue_capacity: 256,
            shutdown_grace_ms: 2_000,
            dead_letter_capacity: 1_000,
            input: None,
        }
    }
}

impl BusConfig {
    /// Delay before the first retry.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Upper bound on any retry delay.
    #[must_use]
    pub const fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Retry processor period.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Cleanup task period.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Stream buffer lifetime.
    #[must_use]
    pub const fn stream_ttl(&self) -> Duration {
        Duration::from_millis(self.stream_ttl_ms)
    }

    /// Retry entry lifetime.
    #[must_use]
    pub const fn retry_ttl(&self) -> Duration {
        Duration::from_millis(self.retry_ttl_ms)
    }

    /// Grace period for in-flight work on shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Checks the policy for values the bus cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error if an attempt count, capacity or period is zero, or
    /// the backoff multiplier is below 1.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(WoodworkError::Config {
                message: message.to_string(),
            })
        };
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.stream_capacity == 0 || self.queue_capacity == 0 || self.dead_letter_capacity == 0 {
            return invalid("stream_capacity, queue_capacity and dead_letter_capacity must be positive");
        }
        if self.retry_interval_ms == 0 || self.cleanup_interval_ms == 0 {
            return invalid("retry_interval_ms and cleanup_interval_ms must be positive");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be a finite number >= 1");
        }
        Ok(())
    }
}

/// Root configuration for a Woodwork run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum lifecycle phases running on workers at once.
    pub workers: usize,
    /// Input value that ends the main loop.
    pub exit_token: String,
    /// Forces a backend regardless of the configuration file.
    pub mode: Option<OrchestrationMode>,
    /// Message bus policy defaults.
    pub bus: BusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            exit_token: DEFAULT_EXIT_TOKEN.to_string(),
            mode: None,
            bus: BusConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Applies `WOODWORK_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is present but malformed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is present but malformed.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.workers = raw.trim().parse().map_err(|_| WoodworkError::Config {
                message: format!("{ENV_WORKERS} must be a positive integer, got \"{raw}\""),
            })?;
        }
        if let Some(token) = lookup(ENV_EXIT_TOKEN) {
            self.exit_token = token;
        }
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = Some(mode.parse()?);
        }
        if self.workers == 0 {
            return Err(WoodworkError::Config {
                message: "workers must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.exit_token, "exit");
        assert!(config.mode.is_none());
        config.bus.validate().expect("default bus config is valid");
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup(&[
                (ENV_WORKERS, "8"),
                (ENV_EXIT_TOKEN, "quit"),
                (ENV_MODE, "sequential"),
            ]))
            .expect("overrides apply");
        assert_eq!(config.workers, 8);
        assert_eq!(config.exit_token, "quit");
        assert_eq!(config.mode, Some(OrchestrationMode::Sequential));
    }

    #[test]
    fn malformed_worker_override_fails() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(lookup(&[(ENV_WORKERS, "many")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_WORKERS), "got: {err}");
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = RuntimeConfig::default();
        assert!(config.apply_overrides(lookup(&[(ENV_WORKERS, "0")])).is_err());
    }

    #[test]
    fn mode_parses_aliases() {
        assert_eq!(
            "BUS".parse::<OrchestrationMode>().expect("alias"),
            OrchestrationMode::MessageBus
        );
        assert!("parallel".parse::<OrchestrationMode>().is_err());
    }

    #[test]
    fn bus_validation_rejects_zero_attempts() {
        let bus = BusConfig {
            max_attempts: 0,
            ..BusConfig::default()
        };
        assert!(bus.validate().is_err());
    }

    #[test]
    fn bus_validation_rejects_shrinking_backoff() {
        let bus = BusConfig {
            backoff_multiplier: 0.5,
            ..BusConfig::default()
        };
        assert!(bus.validate().is_err());
    }

    #[test]
    fn config_serialization_roundtrip() {
        let config = RuntimeConfig {
            mode: Some(OrchestrationMode::MessageBus),
            ..RuntimeConfig::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: RuntimeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
