//! Event Octopus service.
//!
//! Reads its configuration from `EVENT_OCTOPUS_*` environment variables, starts
//! the lifecycle engine and runs until Ctrl+C.
//!
//! Run with: `cargo run --bin event-octopus`
//! Metrics (when `EVENT_OCTOPUS_METRICS_ADDR` is set): `http://{addr}/metrics`

use anyhow::Context;
use event_octopus_runtime::metrics::MetricsServer;
use event_octopus_runtime::{EventOctopus, OctopusConfig};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = OctopusConfig::from_env().context("invalid configuration")?;
    info!(
        retry_interval_secs = config.retry_interval.as_secs(),
        incremental_backoff = config.incremental_backoff,
        max_retry_count = config.max_retry_count,
        broker_port = config.broker_port,
        auto_recover = config.auto_recover,
        purge_completed = config.purge_completed,
        "Starting event octopus"
    );

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("failed to start metrics exporter")?;
    }

    let octopus = EventOctopus::new(config);
    octopus
        .configure()
        .await
        .context("failed to configure event store")?;
    if let Err(e) = octopus.start().await {
        octopus.shutdown().await;
        return Err(e).context("failed to start event octopus");
    }

    let report = octopus.diagnostics().await;
    for check in &report.checks {
        info!(component = %check.component, status = %check.status, "Health check");
    }
    if !report.is_healthy() {
        warn!(status = %report.status, "Started with unhealthy components");
    }

    info!("Press Ctrl+C to shut down gracefully...");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    octopus.shutdown().await;
    info!("Event octopus stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
