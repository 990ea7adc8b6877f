//! Subject names used by the consent-request lifecycle.
//!
//! Producers publish onto [`CONSENT_REQUEST`]. A failing consumer republishes the
//! event onto [`CONSENT_REQUEST_RETRY`]; the engine then forwards it to one of the
//! numbered retry-stage subjects (see [`retry_stage`]). Events that cannot be
//! retried go to [`CONSENT_REQUEST_ERRORED`].

/// Main subject: every state transition of a consent request.
pub const CONSENT_REQUEST: &str = "consentRequest";

/// Retry-request subject: events whose processing failed and should be retried.
pub const CONSENT_REQUEST_RETRY: &str = "consentRequestRetry";

/// Error subject: events that failed in a way that must not be retried.
pub const CONSENT_REQUEST_ERRORED: &str = "consentRequestErrored";

/// Subject of retry stage `stage` for the given base subject.
///
/// ```
/// use event_octopus_core::subject::{retry_stage, CONSENT_REQUEST_RETRY};
///
/// assert_eq!(retry_stage(CONSENT_REQUEST_RETRY, 0), "consentRequestRetry-0");
/// ```
#[must_use]
pub fn retry_stage(base: &str, stage: u32) -> String {
    format!("{base}-{stage}")
}
