//! Lifecycle orchestrator.
//!
//! [`EventOctopus`] owns the event store, the embedded broker and everything
//! wired on top of them:
//!
//! - the main and error subjects persist every event they carry
//! - the retry-request subject forwards events into the retry pipeline until
//!   the retry ceiling is reached, then records them as errored
//! - malformed messages on any of the three subjects are persisted as synthetic
//!   errored records
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured ──configure()──▶ Configured ──start()──▶ Running
//!       ▲                                                  │
//!       └──────────── configure() ◀── ShutDown ◀──shutdown()┘
//! ```

use crate::config::OctopusConfig;
use crate::error::OctopusError;
use crate::health::{HealthCheck, HealthReport};
use crate::metrics::OctopusMetrics;
use crate::pool::ConnectionPool;
use crate::publisher::EventPublisher;
use crate::retry::{build_retry_pipeline, exit_on_failure, FailureHandler, RetryPipeline};
use crate::subscription::{for_all_names, handler, EventHandler, HandlerMap, SubscriptionManager};
use event_octopus_broker::EmbeddedBroker;
use event_octopus_core::event::{Event, EventName, MAX_RETRY_COUNT_REACHED, RETRY_ENQUEUE_FAILED};
use event_octopus_core::event_store::{EventRecordStore, StoreError};
use event_octopus_core::subject::{
    retry_stage, CONSENT_REQUEST, CONSENT_REQUEST_ERRORED, CONSENT_REQUEST_RETRY,
};
use event_octopus_core::transport::Connection;
use event_octopus_sqlite::SqliteEventStore;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Service name of the orchestrator's own subscriptions.
pub const SERVICE_NAME: &str = "event-octopus";

/// Client id of the connection shared by the retry stages.
pub const RETRY_CLIENT_ID: &str = "event-octopus-retry";

/// Human-readable module name.
pub const MODULE_NAME: &str = "Events octopus";

/// Client id used to republish unfinished events at start: [`MODULE_NAME`]
/// without whitespace.
#[must_use]
pub fn recovery_client_id() -> String {
    MODULE_NAME.split_whitespace().collect()
}

/// Lifecycle state of an [`EventOctopus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing opened yet
    Unconfigured,
    /// Storage opened and migrated
    Configured,
    /// Broker, subscriptions and retry stages running
    Running,
    /// Everything released; `configure()` starts a fresh cycle
    ShutDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => write!(f, "unconfigured"),
            Self::Configured => write!(f, "configured"),
            Self::Running => write!(f, "running"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

struct Running {
    pool: Arc<ConnectionPool>,
    subscriptions: Arc<SubscriptionManager>,
    pipeline: RetryPipeline,
}

impl Running {
    async fn stop(&self, broker: &EmbeddedBroker) {
        self.pipeline.stop().await;
        self.subscriptions.unsubscribe_all().await;
        self.pool.close_all().await;
        broker.shutdown();
    }
}

struct Inner {
    state: LifecycleState,
    store: Option<SqliteEventStore>,
    running: Option<Running>,
}

/// The event lifecycle engine.
///
/// # Example
///
/// ```no_run
/// use event_octopus_runtime::{EventOctopus, OctopusConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let octopus = EventOctopus::new(OctopusConfig::from_env()?);
/// octopus.configure().await?;
/// octopus.start().await?;
///
/// let events = octopus.list().await?;
/// println!("{} events tracked", events.len());
///
/// octopus.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct EventOctopus {
    config: OctopusConfig,
    broker: EmbeddedBroker,
    on_failure: FailureHandler,
    inner: Mutex<Inner>,
}

impl EventOctopus {
    /// Create an unconfigured engine. Retry stages that fail to redeliver
    /// terminate the process; see [`EventOctopus::with_failure_handler`].
    #[must_use]
    pub fn new(config: OctopusConfig) -> Self {
        let broker = EmbeddedBroker::new(config.broker_config());
        Self {
            config,
            broker,
            on_failure: exit_on_failure(),
            inner: Mutex::new(Inner {
                state: LifecycleState::Unconfigured,
                store: None,
                running: None,
            }),
        }
    }

    /// Replace the policy applied when a retry stage fails to republish or
    /// acknowledge.
    #[must_use]
    pub fn with_failure_handler(mut self, on_failure: FailureHandler) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &OctopusConfig {
        &self.config
    }

    /// The embedded broker.
    #[must_use]
    pub const fn broker(&self) -> &EmbeddedBroker {
        &self.broker
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Number of running retry stages.
    pub async fn stage_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .running
            .as_ref()
            .map_or(0, |running| running.pipeline.len())
    }

    /// Open the event store, ping it and apply migrations.
    ///
    /// Configuring a configured or running engine is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`OctopusError::Store`] if the store cannot be opened, pinged or
    /// migrated. The engine stays unconfigured.
    pub async fn configure(&self) -> Result<(), OctopusError> {
        let mut inner = self.inner.lock().await;
        if matches!(
            inner.state,
            LifecycleState::Configured | LifecycleState::Running
        ) {
            tracing::debug!(state = %inner.state, "Already configured");
            return Ok(());
        }

        let store = SqliteEventStore::connect(&self.config.connection_string).await?;
        if let Err(error) = prepare(&store).await {
            store.close().await;
            return Err(error.into());
        }

        inner.store = Some(store);
        inner.state = LifecycleState::Configured;

        tracing::info!(
            connection_string = %self.config.connection_string,
            "Event octopus configured"
        );
        Ok(())
    }

    /// Start the broker, the baseline subscriptions and the retry stages, then
    /// run the optional startup recovery and purge.
    ///
    /// # Errors
    ///
    /// - [`OctopusError::InvalidState`] unless the engine is configured
    /// - [`OctopusError::Transport`], [`OctopusError::Subscription`] or
    ///   [`OctopusError::Store`] if any step fails; everything started so far
    ///   is stopped again and the engine stays configured
    pub async fn start(&self) -> Result<(), OctopusError> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Configured {
            return Err(OctopusError::InvalidState {
                expected: LifecycleState::Configured,
                actual: inner.state,
            });
        }
        let Some(store) = inner.store.clone() else {
            return Err(OctopusError::InvalidState {
                expected: LifecycleState::Configured,
                actual: LifecycleState::Unconfigured,
            });
        };

        self.broker.start()?;
        let pool = Arc::new(ConnectionPool::new(Arc::new(self.broker.clone())));
        let subscriptions = Arc::new(
            SubscriptionManager::new(Arc::clone(&pool))
                .with_decode_failure_hook(persisting(store.clone())),
        );
        let retry_connection = match pool.get_connection(RETRY_CLIENT_ID).await {
            Ok(connection) => connection,
            Err(error) => {
                self.broker.shutdown();
                return Err(error.into());
            },
        };
        let running = Running {
            pipeline: build_retry_pipeline(
                CONSENT_REQUEST_RETRY,
                CONSENT_REQUEST,
                self.config.max_retry_count,
                self.config.retry_interval,
                self.config.incremental_backoff,
                Arc::clone(&retry_connection),
                Arc::clone(&self.on_failure),
            ),
            pool,
            subscriptions,
        };

        if let Err(error) = self.launch(&running, &store, retry_connection).await {
            running.stop(&self.broker).await;
            return Err(error);
        }

        inner.running = Some(running);
        inner.state = LifecycleState::Running;

        tracing::info!(
            port = self.config.broker_port,
            stages = self.config.max_retry_count,
            "Event octopus started"
        );
        Ok(())
    }

    async fn launch(
        &self,
        running: &Running,
        store: &SqliteEventStore,
        retry_connection: Arc<dyn Connection>,
    ) -> Result<(), OctopusError> {
        let persist = for_all_names(&persisting(store.clone()));
        running
            .subscriptions
            .subscribe(SERVICE_NAME, CONSENT_REQUEST, persist.clone())
            .await?;
        running
            .subscriptions
            .subscribe(SERVICE_NAME, CONSENT_REQUEST_ERRORED, persist)
            .await?;
        running
            .subscriptions
            .subscribe(
                SERVICE_NAME,
                CONSENT_REQUEST_RETRY,
                retry_handlers(store.clone(), retry_connection, self.config.max_retry_count),
            )
            .await?;

        running.pipeline.start().await?;

        if self.config.auto_recover {
            let connection = running.pool.get_connection(&recovery_client_id()).await?;
            recover(store, &EventPublisher::new(connection)).await?;
        }
        if self.config.purge_completed {
            purge(store).await?;
        }
        Ok(())
    }

    /// Stop the retry stages, close every subscription and connection, stop
    /// the broker and close the store. Safe to call in any state.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(running) = inner.running.take() {
            running.stop(&self.broker).await;
        }
        self.broker.shutdown();
        if let Some(store) = inner.store.take() {
            store.close().await;
        }

        if inner.state != LifecycleState::ShutDown {
            tracing::info!(previous = %inner.state, "Event octopus shut down");
        }
        inner.state = LifecycleState::ShutDown;
    }

    /// Register additional handlers for `service` on `subject`.
    ///
    /// # Errors
    ///
    /// - [`OctopusError::NotRunning`] unless the engine is running
    /// - [`OctopusError::Subscription`] if the subscription cannot be opened
    pub async fn subscribe(
        &self,
        service: &str,
        subject: &str,
        handlers: HandlerMap,
    ) -> Result<(), OctopusError> {
        let subscriptions = self.subscriptions().await?;
        subscriptions.subscribe(service, subject, handlers).await?;
        Ok(())
    }

    /// Cancel the subscription of `service` on `subject`.
    ///
    /// # Errors
    ///
    /// - [`OctopusError::NotRunning`] unless the engine is running
    /// - [`OctopusError::Subscription`] if the pair is unknown or the cancel fails
    pub async fn unsubscribe(&self, service: &str, subject: &str) -> Result<(), OctopusError> {
        let subscriptions = self.subscriptions().await?;
        subscriptions.unsubscribe(service, subject).await?;
        Ok(())
    }

    /// Publisher on the pooled connection of `client_id`.
    ///
    /// # Errors
    ///
    /// - [`OctopusError::NotRunning`] unless the engine is running
    /// - [`OctopusError::Transport`] if the connection cannot be opened
    pub async fn event_publisher(&self, client_id: &str) -> Result<EventPublisher, OctopusError> {
        let pool = {
            let inner = self.inner.lock().await;
            let running = inner.running.as_ref().ok_or(OctopusError::NotRunning)?;
            Arc::clone(&running.pool)
        };
        let connection = pool.get_connection(client_id).await?;
        Ok(EventPublisher::new(connection))
    }

    /// Every stored event.
    ///
    /// # Errors
    ///
    /// [`OctopusError::InvalidState`] before `configure()`, or the store error.
    pub async fn list(&self) -> Result<Vec<Event>, OctopusError> {
        Ok(self.store().await?.list().await?)
    }

    /// The event with `id`, or `None`.
    ///
    /// # Errors
    ///
    /// [`OctopusError::InvalidState`] before `configure()`, or the store error.
    pub async fn get_event(&self, id: &str) -> Result<Option<Event>, OctopusError> {
        Ok(self.store().await?.get(id).await?)
    }

    /// The most recently updated event with `external_id`, or `None`.
    ///
    /// # Errors
    ///
    /// [`OctopusError::InvalidState`] before `configure()`, or the store error.
    pub async fn get_event_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Event>, OctopusError> {
        Ok(self.store().await?.get_by_external_id(external_id).await?)
    }

    /// Liveness of the broker and the event store.
    pub async fn diagnostics(&self) -> HealthReport {
        let store = self.inner.lock().await.store.clone();
        let ping = match store {
            Some(store) => store.ping().await,
            None => Err(StoreError::Closed),
        };

        HealthReport::new(vec![
            HealthCheck::broker(&self.broker.status()),
            HealthCheck::storage(&ping),
        ])
    }

    async fn store(&self) -> Result<SqliteEventStore, OctopusError> {
        let inner = self.inner.lock().await;
        inner.store.clone().ok_or(OctopusError::InvalidState {
            expected: LifecycleState::Configured,
            actual: inner.state,
        })
    }

    async fn subscriptions(&self) -> Result<Arc<SubscriptionManager>, OctopusError> {
        let inner = self.inner.lock().await;
        let running = inner.running.as_ref().ok_or(OctopusError::NotRunning)?;
        Ok(Arc::clone(&running.subscriptions))
    }
}

async fn prepare(store: &SqliteEventStore) -> Result<(), StoreError> {
    store.ping().await?;
    store.migrate().await
}

async fn save(store: &SqliteEventStore, event: &Event) {
    match store.save_or_update(event).await {
        Ok(()) => {
            OctopusMetrics::record_persisted();
            tracing::debug!(id = %event.id, name = %event.name, "Event persisted");
        },
        Err(error) => {
            OctopusMetrics::record_persist_failure();
            tracing::error!(id = %event.id, error = %error, "Failed to persist event");
        },
    }
}

fn persisting(store: SqliteEventStore) -> EventHandler {
    handler(move |event| {
        let store = store.clone();
        async move { save(&store, &event).await }
    })
}

fn retry_handlers(
    store: SqliteEventStore,
    connection: Arc<dyn Connection>,
    max_retry_count: u32,
) -> HandlerMap {
    let forward = handler(move |event| {
        let store = store.clone();
        let connection = Arc::clone(&connection);
        async move { forward_to_retry(&store, connection.as_ref(), max_retry_count, event).await }
    });
    for_all_names(&forward)
}

/// Below the ceiling, publish the event with its counter incremented onto the
/// stage matching its current counter. At or above it, or when the stage
/// publish fails, persist it as errored.
async fn forward_to_retry(
    store: &SqliteEventStore,
    connection: &dyn Connection,
    max_retry_count: u32,
    event: Event,
) {
    if event.retry_count >= max_retry_count {
        let mut event = event;
        event.mark_errored(MAX_RETRY_COUNT_REACHED);
        OctopusMetrics::record_retry_exhausted();
        tracing::warn!(
            id = %event.id,
            retry_count = event.retry_count,
            "Retry ceiling reached, marking event errored"
        );
        save(store, &event).await;
        return;
    }

    let stage = event.retry_count;
    let subject = retry_stage(CONSENT_REQUEST_RETRY, stage);
    let enqueued = match event.clone().next_attempt().encode() {
        Ok(body) => connection
            .publish(&subject, body)
            .await
            .map_err(|e| e.to_string()),
        Err(error) => Err(error.to_string()),
    };

    match enqueued {
        Ok(()) => {
            OctopusMetrics::record_retry_enqueued(stage);
            tracing::debug!(id = %event.id, subject = %subject, "Event enqueued for retry");
        },
        // Nothing redelivers a retry request.
        Err(error) => {
            OctopusMetrics::record_retry_enqueue_failure(stage);
            tracing::error!(
                id = %event.id,
                subject = %subject,
                error = %error,
                "Failed to enqueue retry, marking event errored"
            );
            let mut event = event;
            event.mark_errored(format!("{RETRY_ENQUEUE_FAILED}: {error}"));
            save(store, &event).await;
        },
    }
}

async fn recover(store: &SqliteEventStore, publisher: &EventPublisher) -> Result<(), OctopusError> {
    let unfinished = store.list_excluding(EventName::Completed).await?;
    let mut republished: u64 = 0;
    for event in &unfinished {
        publisher.publish(CONSENT_REQUEST, event).await?;
        republished += 1;
    }

    OctopusMetrics::record_recovered(republished);
    tracing::info!(republished = republished, "Unfinished events republished");
    Ok(())
}

async fn purge(store: &SqliteEventStore) -> Result<(), OctopusError> {
    let deleted = store.delete_by_name(EventName::Completed).await?;

    OctopusMetrics::record_purged(deleted);
    tracing::info!(deleted = deleted, "Completed events purged");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use event_octopus_broker::BrokerConfig;
    use event_octopus_core::transport::Transport;
    use metrics_exporter_prometheus::PrometheusBuilder;

    async fn memory_store() -> SqliteEventStore {
        let store = SqliteEventStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn in_flight(retry_count: u32) -> Event {
        Event::new("u1", EventName::ConsentRequestInFlight, "p")
            .with_external_id("e1")
            .with_retry_count(retry_count)
    }

    #[tokio::test]
    async fn failed_enqueue_marks_event_errored() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        broker.start().unwrap();
        let connection = broker.connect("retry").await.unwrap();
        connection.close().await.unwrap();
        let store = memory_store().await;

        forward_to_retry(&store, connection.as_ref(), 3, in_flight(1)).await;

        let stored = store.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.name, EventName::Errored);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error.unwrap().starts_with(RETRY_ENQUEUE_FAILED));
        assert_eq!(broker.retained("consentRequestRetry-1"), 0);
    }

    #[tokio::test]
    async fn enqueued_event_is_not_persisted() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        broker.start().unwrap();
        let connection = broker.connect("retry").await.unwrap();
        let store = memory_store().await;

        forward_to_retry(&store, connection.as_ref(), 3, in_flight(1)).await;

        assert!(store.get("u1").await.unwrap().is_none());
        assert_eq!(broker.retained("consentRequestRetry-1"), 1);
    }

    #[test]
    fn failed_save_is_counted() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let store = memory_store().await;
                store.close().await;
                save(&store, &in_flight(0)).await;
            });
        });

        assert!(handle.render().contains("octopus_events_persist_failed 1"));
    }

    #[test]
    fn recovery_client_id_strips_whitespace() {
        assert_eq!(recovery_client_id(), "Eventsoctopus");
    }

    #[test]
    fn state_display() {
        assert_eq!(LifecycleState::Unconfigured.to_string(), "unconfigured");
        assert_eq!(LifecycleState::Running.to_string(), "running");
    }

    #[tokio::test]
    async fn new_engine_is_unconfigured() {
        let octopus = EventOctopus::new(OctopusConfig::default());

        assert_eq!(octopus.state().await, LifecycleState::Unconfigured);
        assert_eq!(octopus.stage_count().await, 0);
        assert!(matches!(
            octopus.list().await,
            Err(OctopusError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn failed_configure_stays_unconfigured() {
        let octopus = EventOctopus::new(
            OctopusConfig::default()
                .with_connection_string("sqlite:///nonexistent-dir/for/octopus/events.db"),
        );

        assert!(matches!(
            octopus.configure().await,
            Err(OctopusError::Store(_))
        ));
        assert_eq!(octopus.state().await, LifecycleState::Unconfigured);
    }
}
