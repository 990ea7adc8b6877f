//! Subscription manager.
//!
//! Tracks, per `(service, subject)` pair, one durable transport subscription and
//! a map of event name → handler. Every pair has its own dispatch task that
//! decodes incoming messages and awaits the matching handler, one message at a
//! time.
//!
//! # Example
//!
//! ```no_run
//! use event_octopus_core::event::EventName;
//! use event_octopus_runtime::subscription::{handler, SubscriptionManager};
//! use std::collections::HashMap;
//!
//! # async fn example(manager: SubscriptionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let mut handlers = HashMap::new();
//! handlers.insert(
//!     EventName::ConsentRequestAcked,
//!     handler(|event| async move {
//!         tracing::info!(id = %event.id, "acked");
//!     }),
//! );
//!
//! manager.subscribe("billing", "consentRequest", handlers).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::SubscriptionError;
use crate::metrics::OctopusMetrics;
use crate::pool::ConnectionPool;
use event_octopus_core::event::{Event, EventName};
use event_octopus_core::transport::{
    MessageStream, SubscriptionHandle, SubscriptionOptions, TransportError,
};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Callback invoked with a decoded event.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers of one subscription, keyed by event name.
pub type HandlerMap = HashMap<EventName, EventHandler>;

/// Callback invoked with the synthetic errored record built for an undecodable
/// message.
pub type DecodeFailureHook = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event: Event| -> BoxFuture<'static, ()> { Box::pin(f(event)) })
}

/// Register the same handler for every event name.
#[must_use]
pub fn for_all_names(handler: &EventHandler) -> HandlerMap {
    EventName::ALL
        .iter()
        .map(|name| (*name, Arc::clone(handler)))
        .collect()
}

/// Durable name used for the subscription of `service` on `subject`.
#[must_use]
pub fn durable_name(service: &str, subject: &str) -> String {
    format!("{service}-{subject}")
}

struct TrackedSubscription {
    handle: Arc<dyn SubscriptionHandle>,
    handlers: Arc<RwLock<HandlerMap>>,
}

/// Maps `(service, subject)` pairs to transport subscriptions and handlers.
pub struct SubscriptionManager {
    pool: Arc<ConnectionPool>,
    subscriptions: Mutex<HashMap<(String, String), TrackedSubscription>>,
    on_decode_failure: Option<DecodeFailureHook>,
}

impl SubscriptionManager {
    /// Create a manager that opens connections through `pool`.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            subscriptions: Mutex::new(HashMap::new()),
            on_decode_failure: None,
        }
    }

    /// Hand the synthetic record of every undecodable message to `hook`.
    #[must_use]
    pub fn with_decode_failure_hook(mut self, hook: DecodeFailureHook) -> Self {
        self.on_decode_failure = Some(hook);
        self
    }

    /// Register `handlers` for `service` on `subject`.
    ///
    /// The first registration for a pair opens a durable subscription (durable
    /// name `{service}-{subject}`) on the service's pooled connection. Later
    /// registrations merge into the existing map, replacing handlers for names
    /// registered again, without touching the transport.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the connection or the
    /// subscription cannot be opened; nothing is tracked in that case.
    pub async fn subscribe(
        &self,
        service: &str,
        subject: &str,
        handlers: HandlerMap,
    ) -> Result<(), SubscriptionError> {
        let mut subscriptions = self.subscriptions.lock().await;
        let key = (service.to_string(), subject.to_string());

        if let Some(tracked) = subscriptions.get(&key) {
            let added = handlers.len();
            tracked
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(handlers);
            tracing::debug!(
                service = %service,
                subject = %subject,
                added = added,
                "Handlers merged into existing subscription"
            );
            return Ok(());
        }

        let connection = self.pool.get_connection(service).await?;
        let subscription = connection
            .subscribe(
                subject,
                SubscriptionOptions::new().durable(durable_name(service, subject)),
            )
            .await?;

        let handlers = Arc::new(RwLock::new(handlers));
        tokio::spawn(dispatch(
            service.to_string(),
            subject.to_string(),
            subscription.messages,
            Arc::clone(&handlers),
            self.on_decode_failure.clone(),
        ));

        subscriptions.insert(
            key,
            TrackedSubscription {
                handle: subscription.handle,
                handlers,
            },
        );

        tracing::info!(service = %service, subject = %subject, "Subscribed");
        Ok(())
    }

    /// Cancel the subscription of `service` on `subject` and forget its handlers.
    ///
    /// When the service has no subscription left, its pooled connection is
    /// closed and evicted.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::NotFound`] if the pair is not tracked
    /// - [`SubscriptionError::Transport`] if the transport refuses the cancel
    ///   (the pair stays tracked) or the connection cannot be closed. A
    ///   subscription that is already gone counts as cancelled.
    pub async fn unsubscribe(&self, service: &str, subject: &str) -> Result<(), SubscriptionError> {
        let mut subscriptions = self.subscriptions.lock().await;
        let key = (service.to_string(), subject.to_string());

        let Some(tracked) = subscriptions.get(&key) else {
            return Err(SubscriptionError::NotFound {
                service: service.to_string(),
                subject: subject.to_string(),
            });
        };
        match tracked.handle.unsubscribe().await {
            Ok(()) => {},
            Err(TransportError::SubscriptionClosed(_)) => {
                tracing::debug!(
                    service = %service,
                    subject = %subject,
                    "Subscription already closed by the transport"
                );
            },
            Err(error) => return Err(error.into()),
        }
        subscriptions.remove(&key);

        tracing::info!(service = %service, subject = %subject, "Unsubscribed");

        if !subscriptions.keys().any(|(s, _)| s == service) {
            self.pool.close(service).await?;
        }
        Ok(())
    }

    /// Close every tracked subscription, keeping durable positions, and forget
    /// them all. Failures are logged.
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<((String, String), TrackedSubscription)> =
            self.subscriptions.lock().await.drain().collect();

        for ((service, subject), tracked) in drained {
            if let Err(error) = tracked.handle.close().await {
                tracing::warn!(
                    service = %service,
                    subject = %subject,
                    error = %error,
                    "Failed to close subscription"
                );
            }
        }
    }

    /// Whether `service` is subscribed to `subject`.
    pub async fn has_subscription(&self, service: &str, subject: &str) -> bool {
        self.subscriptions
            .lock()
            .await
            .contains_key(&(service.to_string(), subject.to_string()))
    }

    /// Event names with a registered handler, sorted. Empty if the pair is not
    /// tracked.
    pub async fn handler_names(&self, service: &str, subject: &str) -> Vec<EventName> {
        let subscriptions = self.subscriptions.lock().await;
        let Some(tracked) = subscriptions.get(&(service.to_string(), subject.to_string())) else {
            return Vec::new();
        };
        let mut names: Vec<EventName> = tracked
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        names.sort();
        names
    }

    /// Number of subjects `service` is subscribed to.
    pub async fn subscription_count(&self, service: &str) -> usize {
        self.subscriptions
            .lock()
            .await
            .keys()
            .filter(|(s, _)| s == service)
            .count()
    }
}

async fn dispatch(
    service: String,
    subject: String,
    mut messages: MessageStream,
    handlers: Arc<RwLock<HandlerMap>>,
    on_decode_failure: Option<DecodeFailureHook>,
) {
    while let Some(delivery) = messages.next().await {
        let message = match delivery {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(subject = %subject, error = %error, "Delivery error");
                continue;
            },
        };

        match Event::decode(message.data()) {
            Ok(event) => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&event.name)
                    .cloned();
                match handler {
                    Some(handler) => handler(event).await,
                    None => tracing::debug!(
                        service = %service,
                        subject = %subject,
                        name = %event.name,
                        "No handler registered for event"
                    ),
                }
            },
            Err(error) => {
                OctopusMetrics::record_decode_failure();
                tracing::warn!(
                    subject = %subject,
                    sequence = message.sequence(),
                    error = %error,
                    "Failed to decode event"
                );
                if let Some(hook) = &on_decode_failure {
                    hook(Event::undecodable(message.data(), &error)).await;
                }
            },
        }
    }

    tracing::debug!(service = %service, subject = %subject, "Subscription stream ended");
}
