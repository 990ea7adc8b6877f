//! Broker configuration.

use std::time::Duration;

/// Default cluster identifier.
pub const DEFAULT_CLUSTER_ID: &str = "event-octopus";

/// Default advertised port.
pub const DEFAULT_PORT: u16 = 4222;

/// Configuration of an [`EmbeddedBroker`](crate::EmbeddedBroker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Port reported in the broker status.
    ///
    /// The embedded broker is in-process only; the port identifies the instance
    /// in diagnostics.
    ///
    /// Default: 4222
    pub port: u16,

    /// Cluster identifier reported in the broker status.
    ///
    /// Default: `"event-octopus"`
    pub cluster_id: String,

    /// Number of messages retained per channel. Older messages are dropped and can
    /// no longer be redelivered or replayed.
    ///
    /// Default: 100 000
    pub max_messages_per_channel: usize,

    /// How often unacknowledged messages are checked against their ack-wait.
    ///
    /// Default: 50 ms
    pub redelivery_tick: Duration,
}

impl BrokerConfig {
    /// Create a configuration for the given port with default settings.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set the cluster identifier.
    #[must_use]
    pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    /// Set per-channel retention. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_messages_per_channel(mut self, max: usize) -> Self {
        self.max_messages_per_channel = max.max(1);
        self
    }

    /// Set the redelivery check interval.
    #[must_use]
    pub const fn with_redelivery_tick(mut self, tick: Duration) -> Self {
        self.redelivery_tick = tick;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
            max_messages_per_channel: 100_000,
            redelivery_tick: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 4222);
        assert_eq!(config.cluster_id, "event-octopus");
        assert_eq!(config.max_messages_per_channel, 100_000);
        assert_eq!(config.redelivery_tick, Duration::from_millis(50));
    }

    #[test]
    fn retention_never_zero() {
        let config = BrokerConfig::new(4300).with_max_messages_per_channel(0);
        assert_eq!(config.port, 4300);
        assert_eq!(config.max_messages_per_channel, 1);
    }
}
