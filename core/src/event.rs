//! Event record and event names for the consent-request lifecycle.
//!
//! An [`Event`] describes the current named state of one occurrence of a tracked
//! entity. It is the unit that travels over every subject and the unit that the
//! event record store persists, keyed by its globally unique `id`.
//!
//! # Wire Format
//!
//! Events travel as JSON with camelCase tags. The identifier is emitted under the
//! `uuid` tag (the tag producers and consumers of the workflow already use) and
//! `id` is accepted as an alias on input:
//!
//! ```json
//! {
//!   "uuid": "2c1c5b4e-...",
//!   "externalId": "e_id",
//!   "name": "consentRequest constructed",
//!   "payload": "...",
//!   "retryCount": 0,
//!   "error": null,
//!   "consentId": null,
//!   "transactionId": null,
//!   "initiatorLegalEntity": "urn:nuts:entity:test"
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use event_octopus_core::event::{Event, EventName};
//!
//! let event = Event::new("u1", EventName::ConsentRequestConstructed, "payload")
//!     .with_external_id("e_id");
//!
//! let bytes = event.encode().unwrap();
//! let decoded = Event::decode(&bytes).unwrap();
//! assert_eq!(decoded, event);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error message stored on events that exhausted the retry pipeline.
pub const MAX_RETRY_COUNT_REACHED: &str = "max retry count reached";

/// Error message prefix stored on events that could not be handed to a retry stage.
pub const RETRY_ENQUEUE_FAILED: &str = "failed to enqueue retry";

/// External id (and initiator) given to records synthesized from undecodable messages.
pub const UNKNOWN_EXTERNAL_ID: &str = "unknown";

/// Payload stored when an undecodable message had an empty body.
pub const EMPTY_PAYLOAD_MARKER: &str = "<empty>";

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The message body is not a valid JSON event.
    #[error("Failed to decode event: {0}")]
    Decode(String),

    /// The event could not be encoded to JSON.
    #[error("Failed to encode event: {0}")]
    Encode(String),

    /// The event name is not part of the consent-request lifecycle.
    #[error("Unknown event name: {0}")]
    UnknownEventName(String),

    /// The event carries no identifier.
    #[error("Event has no identifier")]
    MissingId,

    /// The event carries an empty payload.
    #[error("Event {0} has an empty payload")]
    EmptyPayload(String),

    /// An errored event carries no error message.
    #[error("Errored event {0} carries no error message")]
    MissingError(String),
}

/// Named states of the consent-request lifecycle.
///
/// The set is closed: a message naming any other state is rejected at decode time
/// and ends up as a synthetic [`EventName::Errored`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    /// A consent request has been constructed by the initiating party.
    ConsentRequestConstructed,
    /// The consent request is being distributed.
    ConsentRequestInFlight,
    /// The distribution flow failed.
    ConsentRequestFlowErrored,
    /// The distribution flow succeeded.
    ConsentRequestFlowSuccess,
    /// A distributed consent request was received from another party.
    DistributedConsentRequestReceived,
    /// Every party has signed.
    AllSignaturesPresent,
    /// The consent request is in flight towards its final state.
    InFinalFlight,
    /// The consent request has been validated.
    ConsentRequestValid,
    /// The consent request was accepted.
    ConsentRequestAcked,
    /// The consent request was rejected.
    ConsentRequestNacked,
    /// An attachment has been signed.
    AttachmentSigned,
    /// The consent has been distributed.
    ConsentDistributed,
    /// Terminal success state. Purged on startup when configured.
    Completed,
    /// Terminal failure state. Always carries an error message.
    Errored,
}

impl EventName {
    /// Every event name, in lifecycle order.
    pub const ALL: [Self; 14] = [
        Self::ConsentRequestConstructed,
        Self::ConsentRequestInFlight,
        Self::ConsentRequestFlowErrored,
        Self::ConsentRequestFlowSuccess,
        Self::DistributedConsentRequestReceived,
        Self::AllSignaturesPresent,
        Self::InFinalFlight,
        Self::ConsentRequestValid,
        Self::ConsentRequestAcked,
        Self::ConsentRequestNacked,
        Self::AttachmentSigned,
        Self::ConsentDistributed,
        Self::Completed,
        Self::Errored,
    ];

    /// The wire representation of this name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConsentRequestConstructed => "consentRequest constructed",
            Self::ConsentRequestInFlight => "consentRequest in flight",
            Self::ConsentRequestFlowErrored => "consentRequest flow errored",
            Self::ConsentRequestFlowSuccess => "consentRequest flow success",
            Self::DistributedConsentRequestReceived => "distributed ConsentRequest received",
            Self::AllSignaturesPresent => "all signatures present",
            Self::InFinalFlight => "consentRequest in flight for final state",
            Self::ConsentRequestValid => "consentRequest valid",
            Self::ConsentRequestAcked => "consentRequest acked",
            Self::ConsentRequestNacked => "consentRequest nacked",
            Self::AttachmentSigned => "attachment signed",
            Self::ConsentDistributed => "consent distributed",
            Self::Completed => "completed",
            Self::Errored => "error",
        }
    }

    /// Parse a name from its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventName`] if `s` is not a lifecycle state.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventName(s.to_string()))
    }

    /// Whether this is the terminal success state.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EventName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// One persisted record describing the current state of a tracked entity occurrence.
///
/// Records are upserted by `id`: a later event for the same occurrence overwrites
/// the whole row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique identifier of this occurrence (primary key).
    #[serde(rename = "uuid", alias = "id")]
    pub id: String,

    /// Business identifier of the tracked entity; not unique.
    #[serde(default)]
    pub external_id: String,

    /// Current named state.
    pub name: EventName,

    /// Opaque domain data; never empty on a valid event.
    #[serde(default)]
    pub payload: String,

    /// Number of times this event went through the retry pipeline.
    #[serde(default)]
    pub retry_count: u32,

    /// Failure description, set when `name` is [`EventName::Errored`].
    #[serde(default)]
    pub error: Option<String>,

    /// Consent correlation id.
    #[serde(default)]
    pub consent_id: Option<String>,

    /// Transaction correlation id.
    #[serde(default)]
    pub transaction_id: Option<String>,

    /// Legal entity that initiated the consent request.
    #[serde(default)]
    pub initiator_legal_entity: String,
}

impl Event {
    /// Create an event with the mandatory fields set and everything else empty.
    #[must_use]
    pub fn new(id: impl Into<String>, name: EventName, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external_id: String::new(),
            name,
            payload: payload.into(),
            retry_count: 0,
            error: None,
            consent_id: None,
            transaction_id: None,
            initiator_legal_entity: String::new(),
        }
    }

    /// Set the external id.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = external_id.into();
        self
    }

    /// Set the initiating legal entity.
    #[must_use]
    pub fn with_initiator_legal_entity(mut self, initiator: impl Into<String>) -> Self {
        self.initiator_legal_entity = initiator.into();
        self
    }

    /// Set the consent correlation id.
    #[must_use]
    pub fn with_consent_id(mut self, consent_id: impl Into<String>) -> Self {
        self.consent_id = Some(consent_id.into());
        self
    }

    /// Set the transaction correlation id.
    #[must_use]
    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Set the retry counter.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the name.
    #[must_use]
    pub const fn with_name(mut self, name: EventName) -> Self {
        self.name = name;
        self
    }

    /// The same event, one retry attempt further.
    #[must_use]
    pub const fn next_attempt(mut self) -> Self {
        self.retry_count = self.retry_count.saturating_add(1);
        self
    }

    /// Move the event into the terminal [`EventName::Errored`] state.
    pub fn mark_errored(&mut self, reason: impl Into<String>) {
        self.name = EventName::Errored;
        self.error = Some(reason.into());
    }

    /// Whether the event reached the terminal success state.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.name.is_completed()
    }

    /// Build the synthetic record persisted in place of a message that failed to decode.
    ///
    /// The record gets a fresh id, so it never overwrites an existing occurrence.
    #[must_use]
    pub fn undecodable(raw: &[u8], error: &EventError) -> Self {
        let payload = if raw.is_empty() {
            EMPTY_PAYLOAD_MARKER.to_string()
        } else {
            String::from_utf8_lossy(raw).into_owned()
        };

        let mut event = Self::new(uuid::Uuid::new_v4().to_string(), EventName::Errored, payload)
            .with_external_id(UNKNOWN_EXTERNAL_ID)
            .with_initiator_legal_entity(UNKNOWN_EXTERNAL_ID);
        event.error = Some(error.to_string());
        event
    }

    /// Check the invariants every transported and persisted event must satisfy.
    ///
    /// # Errors
    ///
    /// - [`EventError::MissingId`] when `id` is empty
    /// - [`EventError::EmptyPayload`] when `payload` is empty
    /// - [`EventError::MissingError`] when an [`EventName::Errored`] event has
    ///   no (or an empty) error message
    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.is_empty() {
            return Err(EventError::MissingId);
        }
        if self.payload.is_empty() {
            return Err(EventError::EmptyPayload(self.id.clone()));
        }
        if self.name == EventName::Errored && self.error.as_deref().is_none_or(str::is_empty) {
            return Err(EventError::MissingError(self.id.clone()));
        }
        Ok(())
    }

    /// Decode and validate an event from a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] for malformed JSON or unknown names, and the
    /// [`Event::validate`] errors for structurally valid but incomplete events.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let event: Self =
            serde_json::from_slice(bytes).map_err(|e| EventError::Decode(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Encode the event as a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Encode(e.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] external_id={} retry_count={}",
            self.id, self.name, self.external_id, self.retry_count
        )?;
        if let Some(error) = &self.error {
            write!(f, " error={error}")?;
        }
        Ok(())
    }
}
