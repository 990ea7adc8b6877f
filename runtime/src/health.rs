//! Health reporting for the engine's dependencies.
//!
//! [`EventOctopus::diagnostics`](crate::EventOctopus::diagnostics) produces a
//! [`HealthReport`] with one [`HealthCheck`] for the embedded broker and one for
//! event storage.

use event_octopus_broker::BrokerStatus;
use event_octopus_core::event_store::StoreError;

/// Component name of the broker check.
pub const BROKER_COMPONENT: &str = "broker";

/// Component name of the storage check.
pub const STORAGE_COMPONENT: &str = "storage";

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component works but reported a recent error
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of checking one component.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Details when not healthy
    pub message: Option<String>,

    /// Key/value facts about the component (port, mode, ...)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Check derived from the broker's liveness report.
    ///
    /// A stopped broker is unhealthy. A running broker that recorded an error
    /// is degraded.
    #[must_use]
    pub fn broker(status: &BrokerStatus) -> Self {
        let check = match (status.up, &status.last_error) {
            (false, Some(error)) => Self::unhealthy(BROKER_COMPONENT, error.clone()),
            (false, None) => Self::unhealthy(BROKER_COMPONENT, "broker is down"),
            (true, Some(error)) => Self::degraded(BROKER_COMPONENT, error.clone()),
            (true, None) => Self::healthy(BROKER_COMPONENT),
        };

        check
            .with_metadata("mode", status.mode)
            .with_metadata("port", status.port.to_string())
            .with_metadata("cluster_id", status.cluster_id.clone())
    }

    /// Check derived from a storage ping.
    #[must_use]
    pub fn storage(ping: &Result<(), StoreError>) -> Self {
        match ping {
            Ok(()) => Self::healthy(STORAGE_COMPONENT),
            Err(error) => Self::unhealthy(STORAGE_COMPONENT, error.to_string()),
        }
    }
}

/// Aggregated health report
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}
