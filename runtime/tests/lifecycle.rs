//! End-to-end tests of the lifecycle engine on the embedded broker and
//! `SQLite`.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use event_octopus_core::event::{Event, EventName, MAX_RETRY_COUNT_REACHED, UNKNOWN_EXTERNAL_ID};
use event_octopus_core::subject::{CONSENT_REQUEST, CONSENT_REQUEST_ERRORED, CONSENT_REQUEST_RETRY};
use event_octopus_core::transport::Transport;
use event_octopus_runtime::health::{BROKER_COMPONENT, STORAGE_COMPONENT};
use event_octopus_runtime::retry::{FailureHandler, RetryFailure};
use event_octopus_runtime::subscription::{handler, EventHandler};
use event_octopus_runtime::{
    EventOctopus, HealthCheck, HealthReport, HealthStatus, LifecycleState, OctopusConfig,
    OctopusError, SubscriptionError,
};
use event_octopus_testing::{fixtures, init_test_tracing, EventRecorder};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> OctopusConfig {
    OctopusConfig::default()
        .with_retry_interval(Duration::from_millis(50))
        .with_incremental_backoff(2)
        .with_max_retry_count(2)
}

fn recorded_failures() -> (FailureHandler, Arc<Mutex<Vec<RetryFailure>>>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let on_failure: FailureHandler = Arc::new(move |failure| sink.lock().unwrap().push(failure));
    (on_failure, failures)
}

fn octopus(config: OctopusConfig) -> (EventOctopus, Arc<Mutex<Vec<RetryFailure>>>) {
    init_test_tracing();
    let (on_failure, failures) = recorded_failures();
    (
        EventOctopus::new(config).with_failure_handler(on_failure),
        failures,
    )
}

async fn running(config: OctopusConfig) -> (EventOctopus, Arc<Mutex<Vec<RetryFailure>>>) {
    let (octopus, failures) = octopus(config);
    octopus.configure().await.unwrap();
    octopus.start().await.unwrap();
    (octopus, failures)
}

fn temp_db() -> (PathBuf, String) {
    let path = std::env::temp_dir().join(format!("octopus-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    (path, url)
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn stored(octopus: &EventOctopus, id: &str) -> Option<Event> {
    octopus.get_event(id).await.unwrap()
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn configure_is_idempotent() {
        let (octopus, _) = octopus(fast_config());

        octopus.configure().await.unwrap();
        octopus.configure().await.unwrap();

        assert_eq!(octopus.state().await, LifecycleState::Configured);
        assert!(octopus.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_requires_configure() {
        let (octopus, _) = octopus(fast_config());

        let result = octopus.start().await;

        assert!(matches!(
            result,
            Err(OctopusError::InvalidState {
                expected: LifecycleState::Configured,
                actual: LifecycleState::Unconfigured,
            })
        ));
        assert!(!octopus.broker().is_running());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (octopus, _) = running(fast_config()).await;

        assert!(matches!(
            octopus.start().await,
            Err(OctopusError::InvalidState {
                actual: LifecycleState::Running,
                ..
            })
        ));
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn start_creates_one_stage_per_retry() {
        let (octopus, _) = running(fast_config().with_max_retry_count(4)).await;

        assert_eq!(octopus.state().await, LifecycleState::Running);
        assert_eq!(octopus.stage_count().await, 4);
        assert!(octopus.broker().is_running());
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_twice_is_clean() {
        let (octopus, _) = running(fast_config()).await;

        octopus.shutdown().await;
        octopus.shutdown().await;

        assert_eq!(octopus.state().await, LifecycleState::ShutDown);
        assert_eq!(octopus.stage_count().await, 0);
        assert!(!octopus.broker().is_running());
    }

    #[tokio::test]
    async fn shutdown_before_configure_is_clean() {
        let (octopus, _) = octopus(fast_config());
        octopus.shutdown().await;
        assert_eq!(octopus.state().await, LifecycleState::ShutDown);
    }

    #[tokio::test]
    async fn fresh_cycle_after_shutdown() {
        let (octopus, _) = running(fast_config()).await;
        octopus.shutdown().await;

        octopus.configure().await.unwrap();
        octopus.start().await.unwrap();

        let publisher = octopus.event_publisher("producer").await.unwrap();
        let event = fixtures::event(EventName::ConsentRequestConstructed);
        publisher.publish(CONSENT_REQUEST, &event).await.unwrap();

        assert!(eventually(|| async { stored(&octopus, &event.id).await.is_some() }).await);
        octopus.shutdown().await;
    }
}

mod event_flow {
    use super::*;

    #[tokio::test]
    async fn main_and_error_subjects_are_persisted() {
        let (octopus, _) = running(fast_config()).await;
        let publisher = octopus.event_publisher("producer").await.unwrap();

        let constructed = fixtures::event(EventName::ConsentRequestConstructed);
        let mut failed = fixtures::event(EventName::Errored);
        failed.error = Some("signature invalid".to_string());

        publisher.publish(CONSENT_REQUEST, &constructed).await.unwrap();
        publisher
            .publish(CONSENT_REQUEST_ERRORED, &failed)
            .await
            .unwrap();

        assert!(eventually(|| async { octopus.list().await.unwrap().len() == 2 }).await);
        assert_eq!(stored(&octopus, &constructed.id).await.unwrap(), constructed);
        assert_eq!(
            octopus
                .get_event_by_external_id(&failed.external_id)
                .await
                .unwrap()
                .unwrap(),
            failed
        );
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn later_state_overwrites_record() {
        let (octopus, _) = running(fast_config()).await;
        let publisher = octopus.event_publisher("producer").await.unwrap();

        let event = fixtures::event(EventName::ConsentRequestConstructed);
        publisher.publish(CONSENT_REQUEST, &event).await.unwrap();
        let acked = event.clone().with_name(EventName::ConsentRequestAcked);
        publisher.publish(CONSENT_REQUEST, &acked).await.unwrap();

        assert!(
            eventually(|| async {
                stored(&octopus, &event.id)
                    .await
                    .is_some_and(|e| e.name == EventName::ConsentRequestAcked)
            })
            .await
        );
        assert_eq!(octopus.list().await.unwrap().len(), 1);
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn retries_cycle_back_until_ceiling() {
        let (octopus, failures) = running(fast_config()).await;
        let publisher = octopus.event_publisher("consumer").await.unwrap();
        let event = fixtures::event(EventName::ConsentRequestInFlight);

        publisher.publish(CONSENT_REQUEST, &event).await.unwrap();
        assert!(eventually(|| async { stored(&octopus, &event.id).await.is_some() }).await);

        // Each failed attempt comes back on the main subject one count higher.
        for attempt in 1..=2 {
            let current = stored(&octopus, &event.id).await.unwrap();
            publisher
                .publish(CONSENT_REQUEST_RETRY, &current)
                .await
                .unwrap();
            assert!(
                eventually(|| async {
                    stored(&octopus, &event.id)
                        .await
                        .is_some_and(|e| e.retry_count == attempt)
                })
                .await,
                "attempt {attempt} was not redelivered"
            );
        }

        let exhausted = stored(&octopus, &event.id).await.unwrap();
        assert_eq!(exhausted.name, EventName::ConsentRequestInFlight);
        publisher
            .publish(CONSENT_REQUEST_RETRY, &exhausted)
            .await
            .unwrap();

        assert!(
            eventually(|| async {
                stored(&octopus, &event.id)
                    .await
                    .is_some_and(|e| e.name == EventName::Errored)
            })
            .await
        );
        let errored = stored(&octopus, &event.id).await.unwrap();
        assert_eq!(errored.error.as_deref(), Some(MAX_RETRY_COUNT_REACHED));
        assert_eq!(errored.retry_count, 2);
        assert_eq!(octopus.broker().retained("consentRequestRetry-0"), 1);
        assert_eq!(octopus.broker().retained("consentRequestRetry-1"), 1);
        assert!(failures.lock().unwrap().is_empty());
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn zero_ceiling_errors_immediately() {
        let (octopus, _) = running(fast_config().with_max_retry_count(0)).await;
        let publisher = octopus.event_publisher("consumer").await.unwrap();
        let event = fixtures::event(EventName::ConsentRequestInFlight);

        publisher
            .publish(CONSENT_REQUEST_RETRY, &event)
            .await
            .unwrap();

        assert!(
            eventually(|| async {
                stored(&octopus, &event.id)
                    .await
                    .is_some_and(|e| e.name == EventName::Errored)
            })
            .await
        );
        assert_eq!(octopus.stage_count().await, 0);
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn deep_stages_with_saturated_delays_keep_forwarding() {
        let config = fast_config()
            .with_retry_interval(Duration::from_secs(60))
            .with_incremental_backoff(8)
            .with_max_retry_count(25);
        let (octopus, failures) = running(config).await;
        let publisher = octopus.event_publisher("consumer").await.unwrap();

        let deep = fixtures::event(EventName::ConsentRequestInFlight).with_retry_count(22);
        publisher.publish(CONSENT_REQUEST_RETRY, &deep).await.unwrap();
        assert!(
            eventually(|| async { octopus.broker().pending("consentRequestRetry-22") == 1 }).await
        );

        // The retry-request subscription is still alive after the saturated stage.
        let exhausted = fixtures::event(EventName::ConsentRequestInFlight).with_retry_count(30);
        publisher
            .publish(CONSENT_REQUEST_RETRY, &exhausted)
            .await
            .unwrap();
        assert!(
            eventually(|| async {
                stored(&octopus, &exhausted.id)
                    .await
                    .is_some_and(|e| e.name == EventName::Errored)
            })
            .await
        );
        assert!(stored(&octopus, &deep.id).await.is_none());
        assert!(failures.lock().unwrap().is_empty());
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn errored_event_without_message_is_rejected() {
        let (octopus, _) = running(fast_config()).await;
        let raw = octopus.broker().connect("raw").await.unwrap();

        raw.publish(
            CONSENT_REQUEST,
            br#"{"uuid":"e1","name":"error","payload":"p"}"#.to_vec(),
        )
        .await
        .unwrap();

        assert!(eventually(|| async { octopus.list().await.unwrap().len() == 1 }).await);
        assert!(stored(&octopus, "e1").await.is_none());
        let synthetic = octopus.list().await.unwrap().remove(0);
        assert_eq!(synthetic.external_id, UNKNOWN_EXTERNAL_ID);
        assert!(synthetic.error.unwrap().contains("no error message"));

        let publisher = octopus.event_publisher("producer").await.unwrap();
        let mut bare = fixtures::event(EventName::Errored);
        bare.error = None;
        assert!(matches!(
            publisher.publish(CONSENT_REQUEST_ERRORED, &bare).await,
            Err(OctopusError::Event(_))
        ));
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_message_is_persisted_as_errored() {
        let (octopus, _) = running(fast_config()).await;
        let raw = octopus.broker().connect("raw").await.unwrap();

        raw.publish(CONSENT_REQUEST, b"{".to_vec()).await.unwrap();

        assert!(eventually(|| async { octopus.list().await.unwrap().len() == 1 }).await);
        let synthetic = octopus.list().await.unwrap().remove(0);
        assert_eq!(synthetic.name, EventName::Errored);
        assert_eq!(synthetic.external_id, UNKNOWN_EXTERNAL_ID);
        assert_eq!(synthetic.payload, "{");
        assert!(synthetic.error.is_some());

        // The subscription keeps running.
        let publisher = octopus.event_publisher("producer").await.unwrap();
        let event = fixtures::event(EventName::Completed);
        publisher.publish(CONSENT_REQUEST, &event).await.unwrap();
        assert!(eventually(|| async { stored(&octopus, &event.id).await.is_some() }).await);
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_event_name_is_persisted_as_errored() {
        let (octopus, _) = running(fast_config()).await;
        let raw = octopus.broker().connect("raw").await.unwrap();

        raw.publish(
            CONSENT_REQUEST_RETRY,
            br#"{"uuid":"u1","name":"not a state","payload":"p"}"#.to_vec(),
        )
        .await
        .unwrap();

        assert!(eventually(|| async { octopus.list().await.unwrap().len() == 1 }).await);
        assert!(stored(&octopus, "u1").await.is_none());
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_republishes_unfinished_and_purge_drops_completed() {
        let (path, url) = temp_db();
        let unfinished = fixtures::event(EventName::ConsentRequestInFlight);
        let completed = fixtures::event(EventName::Completed);

        {
            let (octopus, _) = running(fast_config().with_connection_string(url.clone())).await;
            let publisher = octopus.event_publisher("producer").await.unwrap();
            publisher.publish(CONSENT_REQUEST, &unfinished).await.unwrap();
            publisher.publish(CONSENT_REQUEST, &completed).await.unwrap();
            assert!(eventually(|| async { octopus.list().await.unwrap().len() == 2 }).await);
            octopus.shutdown().await;
        }

        let (octopus, _) = running(
            fast_config()
                .with_connection_string(url)
                .with_auto_recover(true)
                .with_purge_completed(true),
        )
        .await;

        assert_eq!(octopus.broker().retained(CONSENT_REQUEST), 1);
        assert!(stored(&octopus, &completed.id).await.is_none());
        assert_eq!(stored(&octopus, &unfinished.id).await.unwrap(), unfinished);
        octopus.shutdown().await;
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn without_flags_nothing_is_recovered_or_purged() {
        let (path, url) = temp_db();
        let completed = fixtures::event(EventName::Completed);

        {
            let (octopus, _) = running(fast_config().with_connection_string(url.clone())).await;
            let publisher = octopus.event_publisher("producer").await.unwrap();
            publisher.publish(CONSENT_REQUEST, &completed).await.unwrap();
            assert!(eventually(|| async { stored(&octopus, &completed.id).await.is_some() }).await);
            octopus.shutdown().await;
        }

        let (octopus, _) = running(fast_config().with_connection_string(url)).await;

        assert_eq!(octopus.broker().retained(CONSENT_REQUEST), 0);
        assert!(stored(&octopus, &completed.id).await.is_some());
        octopus.shutdown().await;
        let _ = std::fs::remove_file(path);
    }
}

mod access {
    use super::*;

    fn recording(recorder: &EventRecorder) -> EventHandler {
        let recorder = recorder.clone();
        handler(move |event| {
            let recorder = recorder.clone();
            async move { recorder.record(event) }
        })
    }

    fn component<'a>(report: &'a HealthReport, name: &str) -> &'a HealthCheck {
        report
            .checks
            .iter()
            .find(|check| check.component == name)
            .unwrap()
    }

    #[tokio::test]
    async fn publisher_requires_running_engine() {
        let (octopus, _) = octopus(fast_config());
        octopus.configure().await.unwrap();

        assert!(matches!(
            octopus.event_publisher("producer").await,
            Err(OctopusError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn external_service_subscribes_alongside_persistence() {
        let (octopus, _) = running(fast_config()).await;
        let acked = EventRecorder::new();

        octopus
            .subscribe(
                "billing",
                CONSENT_REQUEST,
                HashMap::from([(EventName::ConsentRequestAcked, recording(&acked))]),
            )
            .await
            .unwrap();

        let publisher = octopus.event_publisher("producer").await.unwrap();
        let event = fixtures::event(EventName::ConsentRequestAcked);
        publisher.publish(CONSENT_REQUEST, &event).await.unwrap();

        assert!(acked.wait_for_len(1, TIMEOUT).await);
        assert!(eventually(|| async { stored(&octopus, &event.id).await.is_some() }).await);

        octopus.unsubscribe("billing", CONSENT_REQUEST).await.unwrap();
        assert!(matches!(
            octopus.unsubscribe("billing", CONSENT_REQUEST).await,
            Err(OctopusError::Subscription(SubscriptionError::NotFound { .. }))
        ));
        octopus.shutdown().await;
    }

    #[tokio::test]
    async fn diagnostics_report_broker_and_storage() {
        let (octopus, _) = running(fast_config().with_broker_port(4333)).await;

        let report = octopus.diagnostics().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        let broker = component(&report, BROKER_COMPONENT);
        assert!(broker.metadata.contains(&("port".to_string(), "4333".to_string())));
        assert!(broker.metadata.contains(&("mode".to_string(), "embedded".to_string())));
        assert_eq!(component(&report, STORAGE_COMPONENT).status, HealthStatus::Healthy);

        octopus.shutdown().await;

        let report = octopus.diagnostics().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(component(&report, BROKER_COMPONENT).status, HealthStatus::Unhealthy);
        assert_eq!(component(&report, STORAGE_COMPONENT).status, HealthStatus::Unhealthy);
    }
}
