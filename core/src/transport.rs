//! Pub/sub transport abstraction.
//!
//! This module defines the capabilities the engine consumes from a messaging
//! transport: named per-client connections, publishing raw bodies onto subjects,
//! and durable, optionally manually-acknowledged subscriptions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect(client_id)  ┌──────────────┐
//! │  Transport   │─────────────────────▶│  Connection  │
//! └──────────────┘                      └──────┬───────┘
//!                                              │ subscribe(subject, options)
//!                                              ▼
//!                                   ┌─────────────────────┐
//!                                   │    Subscription     │
//!                                   │  handle + messages  │
//!                                   └─────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **Manual acknowledgment**: with [`SubscriptionOptions::manual_ack`], a message
//!   that is not acknowledged within the ack-wait window is redelivered
//! - **Durable subscriptions**: with a durable name, the transport remembers the
//!   delivery position (and unacknowledged messages) across reconnects of the same
//!   client id
//!
//! # Dyn Compatibility
//!
//! The traits return `Pin<Box<dyn Future>>` instead of using `async fn` so they can
//! be used as trait objects (`Arc<dyn Connection>`), which is how the connection
//! pool hands connections out.

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to open a connection
    #[error("Connection failed for client '{client_id}': {reason}")]
    ConnectionFailed {
        /// The client id that failed to connect
        client_id: String,
        /// The reason for failure
        reason: String,
    },

    /// The connection was used after it was closed
    #[error("Connection '{0}' is closed")]
    ConnectionClosed(String),

    /// Failed to publish a message to a subject
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// The subject that failed
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a subject
    #[error("Subscription failed for subject '{subject}': {reason}")]
    SubscriptionFailed {
        /// The subject that failed
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// The subscription was used after it was closed
    #[error("Subscription on subject '{0}' is closed")]
    SubscriptionClosed(String),

    /// Failed to acknowledge a message
    #[error("Acknowledgment failed for message {sequence} on subject '{subject}': {reason}")]
    AckFailed {
        /// The subject the message was received on
        subject: String,
        /// The message sequence number
        sequence: u64,
        /// The reason for failure
        reason: String,
    },

    /// The broker is not accepting connections
    #[error("Broker is not running")]
    BrokerNotRunning,
}

/// Where a new (non-resumed) subscription starts delivering from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only messages published after the subscription was created.
    #[default]
    NewOnly,
    /// The last message already in the channel, then new ones.
    LastReceived,
    /// Every message still retained by the channel.
    First,
}

/// Options for opening a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Durable name; the transport remembers the position under `(client id, name)`.
    pub durable_name: Option<String>,
    /// Require explicit [`Message::ack`] calls.
    pub manual_ack: bool,
    /// Time after which an unacknowledged message is redelivered.
    pub ack_wait: Duration,
    /// Start position for a subscription with no remembered position.
    pub start: StartPosition,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            durable_name: None,
            manual_ack: false,
            ack_wait: Duration::from_secs(30),
            start: StartPosition::NewOnly,
        }
    }
}

impl SubscriptionOptions {
    /// Options with transport defaults (auto-ack, new messages only).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the subscription durable under `name`.
    #[must_use]
    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    /// Require manual acknowledgment.
    #[must_use]
    pub const fn manual_ack(mut self) -> Self {
        self.manual_ack = true;
        self
    }

    /// Set the ack-wait window.
    #[must_use]
    pub const fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Set the start position.
    #[must_use]
    pub const fn start_at(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }
}

/// Acknowledges delivered messages on behalf of a subscription.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the message with the given sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AckFailed`] or [`TransportError::SubscriptionClosed`]
    /// if the acknowledgment cannot be recorded.
    fn ack(&self, sequence: u64)
        -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// A message delivered by a subscription.
#[derive(Clone)]
pub struct Message {
    subject: String,
    sequence: u64,
    data: Vec<u8>,
    redelivered: bool,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Message {
    /// Create a message without an acknowledger (auto-acknowledged delivery).
    #[must_use]
    pub fn new(subject: impl Into<String>, sequence: u64, data: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            sequence,
            data,
            redelivered: false,
            acker: None,
        }
    }

    /// Mark the message as a redelivery.
    #[must_use]
    pub const fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Attach the acknowledger used by [`Message::ack`].
    #[must_use]
    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Subject the message was published on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Channel sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw message body.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this is not the first delivery of the message.
    #[must_use]
    pub const fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the message. A no-op for auto-acknowledged deliveries.
    ///
    /// # Errors
    ///
    /// Propagates the acknowledger's error.
    pub async fn ack(&self) -> Result<(), TransportError> {
        match &self.acker {
            Some(acker) => acker.ack(self.sequence).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .field("redelivered", &self.redelivered)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// Stream of messages delivered to a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// Control handle of an open subscription.
pub trait SubscriptionHandle: Send + Sync {
    /// Subject this subscription listens on.
    fn subject(&self) -> &str;

    /// Whether the subscription still delivers messages.
    fn is_valid(&self) -> bool;

    /// Close the subscription. A durable subscription keeps its position and its
    /// unacknowledged messages for the next subscriber with the same durable name.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionClosed`] if already closed.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Cancel the subscription and forget its durable position.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionClosed`] if already closed.
    fn unsubscribe(&self)
        -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// An open subscription: its control handle plus the stream of deliveries.
pub struct Subscription {
    /// Control handle, shareable with whoever may need to cancel the subscription.
    pub handle: Arc<dyn SubscriptionHandle>,
    /// Deliveries. The stream ends when the subscription is closed.
    pub messages: MessageStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.handle.subject())
            .field("valid", &self.handle.is_valid())
            .finish_non_exhaustive()
    }
}

/// A live connection of one client to the transport.
pub trait Connection: Send + Sync {
    /// Client identifier this connection was opened with.
    fn client_id(&self) -> &str;

    /// Whether the connection can currently publish and acknowledge.
    fn is_connected(&self) -> bool;

    /// Publish a raw body onto a subject.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] or [`TransportError::PublishFailed`].
    fn publish(
        &self,
        subject: &str,
        data: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Subscribe to a subject.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] or [`TransportError::SubscriptionFailed`].
    fn subscribe(
        &self,
        subject: &str,
        options: SubscriptionOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, TransportError>> + Send + '_>>;

    /// Close the connection and every subscription opened on it.
    ///
    /// Closing an already closed connection succeeds.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the broker rejects the close.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// Something connections can be opened against.
pub trait Transport: Send + Sync {
    /// Open a connection for `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the transport refuses the
    /// client (for example because the id is already connected), or
    /// [`TransportError::BrokerNotRunning`].
    fn connect(
        &self,
        client_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, TransportError>> + Send + '_>>;
}
