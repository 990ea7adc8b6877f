//! Engine configuration.
//!
//! Values come from code (builder methods) or from the environment through
//! [`OctopusConfig::from_env`]. Unset variables keep their defaults.

use crate::error::ConfigError;
use event_octopus_broker::BrokerConfig;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Base retry delay in whole seconds.
pub const ENV_RETRY_INTERVAL: &str = "EVENT_OCTOPUS_RETRY_INTERVAL";
/// Backoff multiplier between consecutive retry stages.
pub const ENV_INCREMENTAL_BACKOFF: &str = "EVENT_OCTOPUS_INCREMENTAL_BACKOFF";
/// Retry ceiling; also the number of retry stages.
pub const ENV_MAX_RETRY_COUNT: &str = "EVENT_OCTOPUS_MAX_RETRY_COUNT";
/// Storage connection string.
pub const ENV_CONNECTION_STRING: &str = "EVENT_OCTOPUS_CONNECTIONSTRING";
/// Embedded broker port.
pub const ENV_NATS_PORT: &str = "EVENT_OCTOPUS_NATS_PORT";
/// Republish unfinished events at start.
pub const ENV_AUTO_RECOVER: &str = "EVENT_OCTOPUS_AUTO_RECOVER";
/// Delete completed events at start.
pub const ENV_PURGE_COMPLETED: &str = "EVENT_OCTOPUS_PURGE_COMPLETED";
/// Prometheus exporter listen address.
pub const ENV_METRICS_ADDR: &str = "EVENT_OCTOPUS_METRICS_ADDR";

/// Configuration of an [`EventOctopus`](crate::EventOctopus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctopusConfig {
    /// Delay of the first retry stage.
    ///
    /// Default: 60 seconds
    pub retry_interval: Duration,

    /// Stage `i` waits `retry_interval * incremental_backoff^i`.
    ///
    /// Default: 8
    pub incremental_backoff: u32,

    /// Retry ceiling. Events whose retry count reaches it are marked errored.
    ///
    /// Default: 5
    pub max_retry_count: u32,

    /// Storage connection string.
    ///
    /// Default: `sqlite::memory:`
    pub connection_string: String,

    /// Embedded broker port.
    ///
    /// Default: 4222
    pub broker_port: u16,

    /// Republish every non-completed event onto the main subject at start.
    ///
    /// Default: false
    pub auto_recover: bool,

    /// Delete every completed event at start.
    ///
    /// Default: false
    pub purge_completed: bool,

    /// Prometheus exporter address; `None` disables the exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for OctopusConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(60),
            incremental_backoff: 8,
            max_retry_count: 5,
            connection_string: "sqlite::memory:".to_string(),
            broker_port: event_octopus_broker::DEFAULT_PORT,
            auto_recover: false,
            purge_completed: false,
            metrics_addr: None,
        }
    }
}

impl OctopusConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a set variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its
    /// value when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a set variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(seconds) = parse::<u64>(&lookup, ENV_RETRY_INTERVAL)? {
            config.retry_interval = Duration::from_secs(seconds);
        }
        if let Some(backoff) = parse::<u32>(&lookup, ENV_INCREMENTAL_BACKOFF)? {
            if backoff == 0 {
                return Err(invalid(ENV_INCREMENTAL_BACKOFF, "0", "must be at least 1"));
            }
            config.incremental_backoff = backoff;
        }
        if let Some(max) = parse::<u32>(&lookup, ENV_MAX_RETRY_COUNT)? {
            config.max_retry_count = max;
        }
        if let Some(connection_string) = lookup(ENV_CONNECTION_STRING) {
            if connection_string.trim().is_empty() {
                return Err(invalid(ENV_CONNECTION_STRING, "", "must not be empty"));
            }
            config.connection_string = connection_string;
        }
        if let Some(port) = parse::<u16>(&lookup, ENV_NATS_PORT)? {
            config.broker_port = port;
        }
        if let Some(flag) = parse_flag(&lookup, ENV_AUTO_RECOVER)? {
            config.auto_recover = flag;
        }
        if let Some(flag) = parse_flag(&lookup, ENV_PURGE_COMPLETED)? {
            config.purge_completed = flag;
        }
        config.metrics_addr = parse::<SocketAddr>(&lookup, ENV_METRICS_ADDR)?;

        Ok(config)
    }

    /// Set the base retry delay.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn with_incremental_backoff(mut self, backoff: u32) -> Self {
        self.incremental_backoff = backoff;
        self
    }

    /// Set the retry ceiling.
    #[must_use]
    pub const fn with_max_retry_count(mut self, max: u32) -> Self {
        self.max_retry_count = max;
        self
    }

    /// Set the storage connection string.
    #[must_use]
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Set the broker port.
    #[must_use]
    pub const fn with_broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    /// Enable or disable startup recovery.
    #[must_use]
    pub const fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Enable or disable the startup purge of completed events.
    #[must_use]
    pub const fn with_purge_completed(mut self, enabled: bool) -> Self {
        self.purge_completed = enabled;
        self
    }

    /// Set the metrics exporter address.
    #[must_use]
    pub const fn with_metrics_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.metrics_addr = addr;
        self
    }

    /// Configuration of the embedded broker.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::new(self.broker_port)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(key, &raw, &e.to_string()))
        })
        .transpose()
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, ConfigError> {
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        })
        .transpose()
}
