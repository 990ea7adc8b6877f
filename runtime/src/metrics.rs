//! Prometheus metrics for the lifecycle engine.
//!
//! Counters are recorded through the `metrics` facade; without an installed
//! recorder they are no-ops. The binary installs the Prometheus exporter when a
//! listen address is configured.
//!
//! # Example
//!
//! ```rust,no_run
//! use event_octopus_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build or install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter serving `/metrics` over HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create an exporter for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether this server installed the global recorder.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Describe the engine's metrics, install the global recorder and start the
    /// HTTP listener. Must be called from within a Tokio runtime.
    ///
    /// If a recorder is already installed (for example by another test), a warning
    /// is logged and the call succeeds without starting a listener.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the exporter cannot be built or the
    /// listener cannot be bound.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        match PrometheusBuilder::new().with_http_listener(self.addr).install() {
            Ok(()) => {
                register_metrics();
                self.started = true;
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(BuildError::FailedToSetGlobalRecorder(_)) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            },
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }
}

/// Describe every metric the engine records.
pub fn register_metrics() {
    describe_counter!(
        "octopus.events.persisted",
        "Events written to the event store"
    );
    describe_counter!(
        "octopus.events.persist_failed",
        "Events the event store failed to write"
    );
    describe_counter!(
        "octopus.events.decode_failed",
        "Inbound messages that could not be decoded into an event"
    );
    describe_counter!(
        "octopus.retry.enqueued",
        "Events forwarded to a retry stage"
    );
    describe_counter!(
        "octopus.retry.enqueue_failed",
        "Events that could not be forwarded to a retry stage"
    );
    describe_counter!(
        "octopus.retry.exhausted",
        "Events marked errored after reaching the retry ceiling"
    );
    describe_counter!(
        "octopus.retry.redelivered",
        "Events republished onto the main subject by a retry stage"
    );
    describe_counter!(
        "octopus.recovery.republished",
        "Unfinished events republished at startup"
    );
    describe_counter!(
        "octopus.purge.deleted",
        "Completed events deleted at startup"
    );
    describe_counter!(
        "broker.messages.published",
        "Messages published through the embedded broker"
    );
    describe_counter!(
        "broker.messages.redelivered",
        "Unacknowledged messages redelivered by the embedded broker"
    );
    describe_counter!(
        "event_store.writes",
        "Event store writes, labelled insert or update"
    );
}

/// Engine metrics recorder.
pub struct OctopusMetrics;

impl OctopusMetrics {
    /// An event was written to the store.
    pub fn record_persisted() {
        counter!("octopus.events.persisted").increment(1);
    }

    /// Writing an event to the store failed.
    pub fn record_persist_failure() {
        counter!("octopus.events.persist_failed").increment(1);
    }

    /// An inbound message could not be decoded.
    pub fn record_decode_failure() {
        counter!("octopus.events.decode_failed").increment(1);
    }

    /// An event was forwarded to retry stage `stage`.
    pub fn record_retry_enqueued(stage: u32) {
        counter!("octopus.retry.enqueued", "stage" => stage.to_string()).increment(1);
    }

    /// Forwarding an event to retry stage `stage` failed.
    pub fn record_retry_enqueue_failure(stage: u32) {
        counter!("octopus.retry.enqueue_failed", "stage" => stage.to_string()).increment(1);
    }

    /// An event reached the retry ceiling.
    pub fn record_retry_exhausted() {
        counter!("octopus.retry.exhausted").increment(1);
    }

    /// A retry stage republished an event.
    pub fn record_retry_redelivered(stage: &str) {
        counter!("octopus.retry.redelivered", "stage" => stage.to_string()).increment(1);
    }

    /// Startup recovery republished `count` events.
    pub fn record_recovered(count: u64) {
        counter!("octopus.recovery.republished").increment(count);
    }

    /// Startup purge deleted `count` events.
    pub fn record_purged(count: u64) {
        counter!("octopus.purge.deleted").increment(count);
    }
}
