//! # Event Octopus Runtime
//!
//! The lifecycle engine: it persists every event seen on the consent-request
//! subjects and runs failed events through a multi-stage delayed retry
//! pipeline.
//!
//! ## Core Components
//!
//! - **[`ConnectionPool`]**: one cached transport connection per client id
//! - **[`SubscriptionManager`]**: durable subscriptions with per-event-name
//!   handlers, merged incrementally
//! - **[`RetryPipeline`]**: numbered stage subjects, each holding messages for an
//!   exponentially growing delay before republishing them
//! - **[`EventOctopus`]**: configures storage, starts the embedded broker and
//!   wires all of the above
//!
//! ## Example
//!
//! ```no_run
//! use event_octopus_runtime::{EventOctopus, OctopusConfig};
//! use event_octopus_core::event::{Event, EventName};
//! use event_octopus_core::subject::CONSENT_REQUEST;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OctopusConfig::default()
//!     .with_retry_interval(Duration::from_secs(30))
//!     .with_max_retry_count(3);
//!
//! let octopus = EventOctopus::new(config);
//! octopus.configure().await?;
//! octopus.start().await?;
//!
//! let publisher = octopus.event_publisher("consent-service").await?;
//! let event = Event::new("u1", EventName::ConsentRequestConstructed, "payload");
//! publisher.publish(CONSENT_REQUEST, &event).await?;
//!
//! octopus.shutdown().await;
//! # Ok(())
//! # }
//! ```

/// Engine configuration
pub mod config;

/// Error types of the engine
pub mod error;

/// Broker and storage health reporting
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Lifecycle orchestrator
pub mod octopus;

/// Connection pool keyed by client id
pub mod pool;

/// Typed event publishing
pub mod publisher;

/// Multi-stage delayed retry pipeline
pub mod retry;

/// Subscription manager
pub mod subscription;

pub use config::OctopusConfig;
pub use error::{ConfigError, OctopusError, SubscriptionError};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use octopus::{EventOctopus, LifecycleState};
pub use pool::ConnectionPool;
pub use publisher::EventPublisher;
pub use retry::{build_retry_pipeline, DelayedConsumer, FailureHandler, RetryPipeline};
pub use subscription::{EventHandler, HandlerMap, SubscriptionManager};
