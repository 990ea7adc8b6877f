//! # Event Octopus Core
//!
//! Core types and abstractions for the Event Octopus lifecycle engine.
//!
//! The engine listens to every state-transition event of a consent request,
//! records the latest state of each event in a durable store, and runs a
//! multi-stage delayed-retry pipeline for events whose processing failed.
//!
//! This crate holds the pieces every other crate agrees on:
//!
//! - [`event`]: the event record, its lifecycle names and wire codec
//! - [`subject`]: subject names of the consent-request lifecycle
//! - [`transport`]: the pub/sub transport the engine talks to
//! - [`event_store`]: the durable event-record store
//!
//! ## Example
//!
//! ```
//! use event_octopus_core::event::{Event, EventName};
//!
//! let event = Event::new("e-1", EventName::ConsentRequestConstructed, "{}")
//!     .with_external_id("ext-1");
//! let bytes = event.encode().unwrap();
//! assert_eq!(Event::decode(&bytes).unwrap(), event);
//! ```

pub mod event;
pub mod event_store;
pub mod subject;
pub mod transport;

pub use event::{Event, EventError, EventName};
pub use event_store::{EventRecordStore, StoreError};
pub use transport::{
    Acknowledger, Connection, Message, MessageStream, StartPosition, Subscription,
    SubscriptionHandle, SubscriptionOptions, Transport, TransportError,
};
