//! # Event Octopus Testing
//!
//! Testing utilities shared by the workspace's test suites:
//! - [`fixtures`]: event builders with unique ids
//! - [`EventRecorder`]: a handler sink that records every event it receives
//! - [`wait_for`]: poll a condition until it holds or a deadline passes
//! - [`init_test_tracing`]: route `tracing` output to the test writer
//!
//! ## Example
//!
//! ```
//! use event_octopus_testing::{fixtures, EventRecorder};
//! use event_octopus_core::event::EventName;
//!
//! let recorder = EventRecorder::new();
//! recorder.record(fixtures::event(EventName::Completed));
//! assert_eq!(recorder.len(), 1);
//! ```

use event_octopus_core::event::Event;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Polling period of [`wait_for`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Event builders.
pub mod fixtures {
    use event_octopus_core::event::{Event, EventName};

    /// Initiating legal entity used by fixture events.
    pub const INITIATOR: &str = "urn:nuts:entity:test";

    /// Error message given to [`EventName::Errored`] fixtures.
    pub const ERROR: &str = "test failure";

    /// A valid event named `name` with a fresh id and external id.
    #[must_use]
    pub fn event(name: EventName) -> Event {
        let id = uuid::Uuid::new_v4().to_string();
        event_with_ids(&id, &format!("ext-{id}"), name)
    }

    /// A valid event named `name` with the given ids.
    #[must_use]
    pub fn event_with_ids(id: &str, external_id: &str, name: EventName) -> Event {
        let mut event = Event::new(id, name, "test")
            .with_external_id(external_id)
            .with_initiator_legal_entity(INITIATOR);
        if name == EventName::Errored {
            event.error = Some(ERROR.to_string());
        }
        event
    }
}

/// Records every event handed to it. Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `event`.
    pub fn record(&self, event: Event) {
        self.lock().push(event);
    }

    /// Snapshot of the recorded events, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `count` events were recorded. Returns `false` on
    /// timeout.
    pub async fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        wait_for(timeout, || self.len() >= count).await
    }
}

/// Poll `condition` every [`POLL_INTERVAL`] until it returns `true` or
/// `timeout` elapses. Returns the last evaluation.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Install a `tracing` subscriber writing to the test output, filtered by
/// `RUST_LOG` (default `debug`). Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
