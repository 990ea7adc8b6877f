//! Error types of the lifecycle engine.

use crate::octopus::LifecycleState;
use event_octopus_core::event::EventError;
use event_octopus_core::event_store::StoreError;
use event_octopus_core::transport::TransportError;
use thiserror::Error;

/// A configuration value could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value of `key` is malformed or out of range
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        /// Configuration key (environment variable name)
        key: String,
        /// The offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Errors of the subscription manager.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// No subscription is tracked for the pair
    #[error("No subscription for service '{service}' on subject '{subject}'")]
    NotFound {
        /// Service name
        service: String,
        /// Subject
        subject: String,
    },

    /// The transport refused the operation
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors of the lifecycle orchestrator.
#[derive(Error, Debug)]
pub enum OctopusError {
    /// Storage failure (open, ping, migration, query)
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Transport failure (broker start, connect, publish, subscribe)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Subscription management failure
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An event could not be encoded
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid lifecycle state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires
        expected: LifecycleState,
        /// Current state
        actual: LifecycleState,
    },

    /// Operation requires a running engine
    #[error("Event octopus is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let error = OctopusError::InvalidState {
            expected: LifecycleState::Configured,
            actual: LifecycleState::Unconfigured,
        };
        assert_eq!(
            error.to_string(),
            "Invalid lifecycle state: expected configured, found unconfigured"
        );
    }

    #[test]
    fn subscription_error_converts_into_octopus_error() {
        let error: OctopusError = SubscriptionError::NotFound {
            service: "svc".to_string(),
            subject: "subj".to_string(),
        }
        .into();
        assert!(matches!(
            error,
            OctopusError::Subscription(SubscriptionError::NotFound { .. })
        ));
    }
}
