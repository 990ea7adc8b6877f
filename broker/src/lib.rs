//! Embedded in-process broker for Event Octopus.
//!
//! This crate provides [`EmbeddedBroker`], an in-process pub/sub broker that
//! implements the [`Transport`] trait from `event-octopus-core`. The lifecycle
//! engine starts it next to itself, so a single process owns both the broker and
//! the consumers that keep the event store up to date.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ publish  ┌───────────────────┐  fan-out  ┌──────────────┐
//! │  Connection  │─────────▶│ channel (subject) │──────────▶│ subscription │
//! └──────────────┘          │  retained log     │           │    stream    │
//!                           └───────────────────┘           └──────┬───────┘
//!                                     ▲                            │ ack
//!                                     │ redeliver after ack-wait   │
//!                           ┌─────────┴─────────┐                  │
//!                           │      sweeper      │◀─────────────────┘
//!                           └───────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** for manual-ack subscriptions:
//! - A delivered message stays pending until it is acknowledged
//! - Once its ack-wait has elapsed it is delivered again with the redelivered flag set
//! - A durable subscription keeps its position and its pending messages when it
//!   (or its connection) is closed, and resumes them when the same client id
//!   subscribes again with the same durable name
//!
//! Auto-ack subscriptions get each message exactly once while they are open.
//!
//! # Example
//!
//! ```
//! use event_octopus_broker::{BrokerConfig, EmbeddedBroker};
//! use event_octopus_core::transport::{SubscriptionOptions, Transport};
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = EmbeddedBroker::new(BrokerConfig::default());
//! broker.start()?;
//!
//! let connection = broker.connect("orders").await?;
//! let mut subscription = connection
//!     .subscribe("order-events", SubscriptionOptions::new())
//!     .await?;
//!
//! connection.publish("order-events", b"placed".to_vec()).await?;
//!
//! let message = subscription.messages.next().await.unwrap()?;
//! assert_eq!(message.data(), b"placed");
//!
//! broker.shutdown();
//! # Ok(())
//! # }
//! ```

mod config;
mod state;

pub use config::{BrokerConfig, DEFAULT_CLUSTER_ID, DEFAULT_PORT};

use event_octopus_core::transport::{
    Acknowledger, Connection, Subscription, SubscriptionHandle, SubscriptionOptions, Transport,
    TransportError,
};
use state::{ActiveSubscription, BrokerState, DurableKey};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// Liveness report of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    /// Whether the broker accepts connections.
    pub up: bool,
    /// Deployment mode; always `"embedded"`.
    pub mode: &'static str,
    /// Configured port.
    pub port: u16,
    /// Configured cluster identifier.
    pub cluster_id: String,
    /// Last error observed by the broker, if any.
    pub last_error: Option<String>,
}

struct Shared {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// In-process pub/sub broker.
///
/// Cloning is cheap; clones share the same broker.
///
/// The broker must be [started](EmbeddedBroker::start) before clients can
/// connect. Shutting it down closes every connection and subscription but keeps
/// channel contents and durable positions, so a restarted broker resumes durable
/// subscriptions where they stopped.
#[derive(Clone)]
pub struct EmbeddedBroker {
    shared: Arc<Shared>,
}

impl EmbeddedBroker {
    /// Create a stopped broker.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BrokerState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Start accepting connections and run the redelivery sweeper.
    ///
    /// Starting a running broker is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] when called outside a Tokio
    /// runtime, since the sweeper cannot be spawned.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        if state.running {
            tracing::debug!(port = self.shared.config.port, "Broker already running");
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            let reason = format!("no async runtime to run the broker on: {e}");
            state.last_error = Some(reason.clone());
            TransportError::ConnectionFailed {
                client_id: self.shared.config.cluster_id.clone(),
                reason,
            }
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        handle.spawn(run_sweeper(
            Arc::downgrade(&self.shared),
            self.shared.config.redelivery_tick,
            stop_rx,
        ));

        state.running = true;
        state.last_error = None;
        state.stop_sweeper = Some(stop_tx);
        drop(state);

        tracing::info!(
            port = self.shared.config.port,
            cluster_id = %self.shared.config.cluster_id,
            "Embedded broker started"
        );
        Ok(())
    }

    /// Stop the broker: close every connection and subscription and stop the
    /// sweeper. Stopping a stopped broker is a no-op.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(stop) = state.stop_sweeper.take() {
            let _ = stop.send(true);
        }
        state.remove_all();
        drop(state);

        tracing::info!(port = self.shared.config.port, "Embedded broker stopped");
    }

    /// Whether the broker accepts connections.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Liveness report.
    #[must_use]
    pub fn status(&self) -> BrokerStatus {
        let state = self.shared.lock();
        BrokerStatus {
            up: state.running,
            mode: "embedded",
            port: self.shared.config.port,
            cluster_id: self.shared.config.cluster_id.clone(),
            last_error: state.last_error.clone(),
        }
    }

    /// Number of messages currently retained for `subject`.
    #[must_use]
    pub fn retained(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .channels
            .get(subject)
            .map_or(0, state::Channel::len)
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().subscriptions.len()
    }

    /// Number of messages delivered but not yet acknowledged, across all open
    /// subscriptions on `subject`.
    #[must_use]
    pub fn pending(&self, subject: &str) -> usize {
        self.shared
            .lock()
            .subscriptions
            .values()
            .filter(|sub| sub.subject == subject)
            .map(|sub| sub.pending.len())
            .sum()
    }
}

impl Transport for EmbeddedBroker {
    fn connect(
        &self,
        client_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, TransportError>> + Send + '_>>
    {
        let client_id = client_id.to_string();

        Box::pin(async move {
            let mut state = self.shared.lock();
            if !state.running {
                return Err(TransportError::BrokerNotRunning);
            }
            if state.clients.contains_key(&client_id) {
                return Err(TransportError::ConnectionFailed {
                    client_id,
                    reason: "client id is already connected".to_string(),
                });
            }

            let connection_id = self.shared.next_id();
            state.clients.insert(client_id.clone(), connection_id);
            drop(state);

            tracing::debug!(client_id = %client_id, "Client connected");

            let connection: Arc<dyn Connection> = Arc::new(EmbeddedConnection {
                shared: Arc::clone(&self.shared),
                client_id,
                connection_id,
                closed: AtomicBool::new(false),
            });
            Ok(connection)
        })
    }
}

struct EmbeddedConnection {
    shared: Arc<Shared>,
    client_id: String,
    connection_id: u64,
    closed: AtomicBool,
}

impl EmbeddedConnection {
    fn ensure_live(&self, state: &BrokerState) -> Result<(), TransportError> {
        if !state.running {
            return Err(TransportError::BrokerNotRunning);
        }
        if self.closed.load(Ordering::SeqCst) || !state.is_live(&self.client_id, self.connection_id)
        {
            return Err(TransportError::ConnectionClosed(self.client_id.clone()));
        }
        Ok(())
    }
}

impl Connection for EmbeddedConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.shared.lock().is_live(&self.client_id, self.connection_id)
    }

    fn publish(
        &self,
        subject: &str,
        data: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let subject = subject.to_string();

        Box::pin(async move {
            let mut state = self.shared.lock();
            self.ensure_live(&state).map_err(|e| TransportError::PublishFailed {
                subject: subject.clone(),
                reason: e.to_string(),
            })?;

            let sequence =
                state.publish(&subject, data, self.shared.config.max_messages_per_channel);
            drop(state);

            metrics::counter!("broker.messages.published").increment(1);
            tracing::debug!(
                subject = %subject,
                sequence = sequence,
                client_id = %self.client_id,
                "Message published"
            );
            Ok(())
        })
    }

    fn subscribe(
        &self,
        subject: &str,
        options: SubscriptionOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, TransportError>> + Send + '_>> {
        let subject = subject.to_string();

        Box::pin(async move {
            let mut state = self.shared.lock();
            self.ensure_live(&state)
                .map_err(|e| TransportError::SubscriptionFailed {
                    subject: subject.clone(),
                    reason: e.to_string(),
                })?;

            let durable = options.durable_name.as_ref().map(|name| DurableKey {
                client_id: self.client_id.clone(),
                subject: subject.clone(),
                name: name.clone(),
            });
            if let Some(key) = &durable {
                if state.has_active_durable(key) {
                    return Err(TransportError::SubscriptionFailed {
                        subject,
                        reason: format!("durable subscription '{}' is already active", key.name),
                    });
                }
            }

            let id = self.shared.next_id();
            let acker = options.manual_ack.then(|| {
                Arc::new(SubscriptionAcker {
                    shared: Arc::downgrade(&self.shared),
                    subscription_id: id,
                    subject: subject.clone(),
                    durable: durable.clone(),
                }) as Arc<dyn Acknowledger>
            });

            let (sender, mut receiver) = mpsc::unbounded_channel();
            state.open(
                id,
                ActiveSubscription {
                    client_id: self.client_id.clone(),
                    connection_id: self.connection_id,
                    subject: subject.clone(),
                    durable,
                    ack_wait: options.ack_wait,
                    acker,
                    sender,
                    last_sent: 0,
                    pending: std::collections::BTreeMap::new(),
                },
                options.start,
            );
            drop(state);

            tracing::debug!(
                subject = %subject,
                client_id = %self.client_id,
                durable_name = ?options.durable_name,
                manual_ack = options.manual_ack,
                "Subscription opened"
            );

            let messages = Box::pin(async_stream::stream! {
                while let Some(message) = receiver.recv().await {
                    yield Ok::<_, TransportError>(message);
                }
            });

            Ok(Subscription {
                handle: Arc::new(EmbeddedSubscription {
                    shared: Arc::clone(&self.shared),
                    id,
                    subject,
                }),
                messages,
            })
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            let mut state = self.shared.lock();
            if state.clients.get(&self.client_id) == Some(&self.connection_id) {
                state.clients.remove(&self.client_id);
            }
            let closed = state.remove_connection(self.connection_id);
            drop(state);

            tracing::debug!(
                client_id = %self.client_id,
                subscriptions = closed,
                "Connection closed"
            );
            Ok(())
        })
    }
}

struct EmbeddedSubscription {
    shared: Arc<Shared>,
    id: u64,
    subject: String,
}

impl EmbeddedSubscription {
    fn remove(&self, forget_durable: bool) -> Result<(), TransportError> {
        self.shared
            .lock()
            .remove(self.id, forget_durable)
            .map(|_| ())
            .ok_or_else(|| TransportError::SubscriptionClosed(self.subject.clone()))
    }
}

impl SubscriptionHandle for EmbeddedSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn is_valid(&self) -> bool {
        self.shared.lock().subscriptions.contains_key(&self.id)
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move { self.remove(false) })
    }

    fn unsubscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move { self.remove(true) })
    }
}

struct SubscriptionAcker {
    shared: Weak<Shared>,
    subscription_id: u64,
    subject: String,
    durable: Option<DurableKey>,
}

impl Acknowledger for SubscriptionAcker {
    fn ack(
        &self,
        sequence: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let failed = |reason: &str| TransportError::AckFailed {
                subject: self.subject.clone(),
                sequence,
                reason: reason.to_string(),
            };

            let shared = self.shared.upgrade().ok_or_else(|| failed("broker is gone"))?;
            let mut state = shared.lock();
            if !state.running {
                return Err(TransportError::BrokerNotRunning);
            }
            if state.ack(self.subscription_id, self.durable.as_ref(), sequence) {
                Ok(())
            } else {
                Err(TransportError::SubscriptionClosed(self.subject.clone()))
            }
        })
    }
}

async fn run_sweeper(
    shared: Weak<Shared>,
    tick: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let redelivered = shared.lock().redeliver_expired(Instant::now());
                if redelivered > 0 {
                    metrics::counter!("broker.messages.redelivered").increment(redelivered);
                    tracing::debug!(count = redelivered, "Redelivered unacknowledged messages");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Redelivery sweeper stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn start_outside_runtime_records_error() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        let result = broker.start();

        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
        let status = broker.status();
        assert!(!status.up);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn status_reports_configuration() {
        let broker = EmbeddedBroker::new(BrokerConfig::new(4333).with_cluster_id("test-cluster"));
        assert!(!broker.status().up);

        broker.start().unwrap();
        let status = broker.status();
        assert!(status.up);
        assert_eq!(status.mode, "embedded");
        assert_eq!(status.port, 4333);
        assert_eq!(status.cluster_id, "test-cluster");
        assert_eq!(status.last_error, None);

        broker.shutdown();
        assert!(!broker.is_running());
    }

    #[tokio::test]
    async fn connect_requires_running_broker() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        let result = broker.connect("client").await;
        assert!(matches!(result, Err(TransportError::BrokerNotRunning)));
    }

    #[tokio::test]
    async fn duplicate_client_id_rejected() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        broker.start().unwrap();

        let first = broker.connect("client").await.unwrap();
        assert!(broker.connect("client").await.is_err());

        first.close().await.unwrap();
        assert!(broker.connect("client").await.is_ok());
    }
}
