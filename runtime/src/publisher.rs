//! Typed event publishing.

use crate::error::OctopusError;
use event_octopus_core::event::Event;
use event_octopus_core::transport::Connection;
use std::sync::Arc;

/// Publishes [`Event`]s as JSON on a pooled connection.
///
/// Obtained from [`EventOctopus::event_publisher`](crate::EventOctopus::event_publisher).
#[derive(Clone)]
pub struct EventPublisher {
    connection: Arc<dyn Connection>,
}

impl EventPublisher {
    /// Wrap `connection`.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Client id of the underlying connection.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.connection.client_id()
    }

    /// Validate, encode and publish `event` on `subject`.
    ///
    /// # Errors
    ///
    /// - [`OctopusError::Event`] if the event is invalid or cannot be encoded
    /// - [`OctopusError::Transport`] if the publish fails
    pub async fn publish(&self, subject: &str, event: &Event) -> Result<(), OctopusError> {
        event.validate()?;
        let body = event.encode()?;
        self.connection.publish(subject, body).await?;

        tracing::debug!(
            client_id = %self.connection.client_id(),
            subject = %subject,
            id = %event.id,
            name = %event.name,
            "Event published"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use event_octopus_broker::{BrokerConfig, EmbeddedBroker};
    use event_octopus_core::event::{EventError, EventName};
    use event_octopus_core::transport::{SubscriptionOptions, Transport};
    use event_octopus_testing::fixtures;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn publishes_json_body() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        broker.start().unwrap();
        let consumer = broker.connect("consumer").await.unwrap();
        let mut subscription = consumer
            .subscribe("consentRequest", SubscriptionOptions::new())
            .await
            .unwrap();
        let publisher = EventPublisher::new(broker.connect("producer").await.unwrap());
        let event = fixtures::event(EventName::ConsentRequestConstructed);

        publisher.publish("consentRequest", &event).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), subscription.messages.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(Event::decode(message.data()).unwrap(), event);
        assert_eq!(publisher.client_id(), "producer");
    }

    #[tokio::test]
    async fn rejects_invalid_event() {
        let broker = EmbeddedBroker::new(BrokerConfig::default());
        broker.start().unwrap();
        let publisher = EventPublisher::new(broker.connect("producer").await.unwrap());
        let event = Event::new("u1", EventName::Completed, "");

        let result = publisher.publish("consentRequest", &event).await;

        assert!(matches!(
            result,
            Err(OctopusError::Event(EventError::EmptyPayload(_)))
        ));
        assert_eq!(broker.retained("consentRequest"), 0);
    }
}
