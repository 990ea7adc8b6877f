//! Multi-stage delayed retry pipeline.
//!
//! Instead of one timer per failed event, retries flow through a fixed set of
//! durable stage subjects. Stage `i` holds every message it receives for
//! `base_delay * exponent^i`, then republishes the body unchanged onto the target
//! subject and acknowledges it. A message whose republish never happens (process
//! crash, stage stopped) stays unacknowledged and is redelivered by the transport
//! after the stage's ack-wait, which is always longer than the stage delay.
//!
//! ```text
//! retry-request ──▶ orchestrator ──▶ stage-0 ──(d)──────▶ main
//!                        │        ──▶ stage-1 ──(d·k)────▶ main
//!                        │        ──▶ stage-2 ──(d·k²)───▶ main
//!                        └─ retry_count ≥ ceiling ──▶ errored record
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use event_octopus_runtime::retry::{build_retry_pipeline, exit_on_failure};
//! use std::time::Duration;
//! # use std::sync::Arc;
//! # use event_octopus_core::transport::Connection;
//!
//! # async fn example(connection: Arc<dyn Connection>) -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = build_retry_pipeline(
//!     "consentRequestRetry",
//!     "consentRequest",
//!     5,
//!     Duration::from_secs(60),
//!     8,
//!     connection,
//!     exit_on_failure(),
//! );
//! pipeline.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::OctopusMetrics;
use event_octopus_core::subject::retry_stage;
use event_octopus_core::transport::{
    Connection, Message, MessageStream, StartPosition, SubscriptionHandle, SubscriptionOptions,
    TransportError,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Extra ack-wait on top of the stage delay.
pub const ACK_WAIT_MARGIN: Duration = Duration::from_secs(1);

/// A stage could not republish or acknowledge a message.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// Subject the stage consumes
    pub stage: String,
    /// Subject the stage republishes to
    pub target: String,
    /// Sequence of the message on the stage subject
    pub sequence: u64,
    /// What went wrong
    pub error: TransportError,
}

/// Policy applied when a stage fails to republish or acknowledge.
pub type FailureHandler = Arc<dyn Fn(RetryFailure) + Send + Sync>;

/// Default failure policy: log the failure and terminate the process with a
/// non-zero exit code.
///
/// Retrying silently would risk unbounded duplicate delivery, so a broken
/// transport is treated as fatal and the supervisor restarts the process.
#[must_use]
pub fn exit_on_failure() -> FailureHandler {
    Arc::new(|failure: RetryFailure| {
        tracing::error!(
            stage = %failure.stage,
            target = %failure.target,
            sequence = failure.sequence,
            error = %failure.error,
            "Retry stage failed to redeliver, terminating"
        );
        std::process::exit(1);
    })
}

/// Delay of stage `stage`: `base * exponent^stage`, saturating at
/// [`Duration::MAX`].
///
/// ```
/// use event_octopus_runtime::retry::stage_delay;
/// use std::time::Duration;
///
/// assert_eq!(stage_delay(Duration::from_secs(1), 2, 3), Duration::from_secs(8));
/// ```
#[must_use]
pub fn stage_delay(base: Duration, exponent: u32, stage: u32) -> Duration {
    (0..stage).fold(base, |delay, _| delay.saturating_mul(exponent))
}

struct StageContext {
    consume_subject: String,
    publish_subject: String,
    delay: Duration,
    connection: Arc<dyn Connection>,
    on_failure: FailureHandler,
}

struct RunningStage {
    handle: Arc<dyn SubscriptionHandle>,
    cancel: watch::Sender<bool>,
}

/// One retry stage: consumes a stage subject and republishes every message onto
/// the target subject after a fixed delay.
pub struct DelayedConsumer {
    context: Arc<StageContext>,
    running: Mutex<Option<RunningStage>>,
}

impl DelayedConsumer {
    /// Create a stopped stage.
    #[must_use]
    pub fn new(
        consume_subject: impl Into<String>,
        publish_subject: impl Into<String>,
        delay: Duration,
        connection: Arc<dyn Connection>,
        on_failure: FailureHandler,
    ) -> Self {
        Self {
            context: Arc::new(StageContext {
                consume_subject: consume_subject.into(),
                publish_subject: publish_subject.into(),
                delay,
                connection,
                on_failure,
            }),
            running: Mutex::new(None),
        }
    }

    /// Subject this stage consumes.
    #[must_use]
    pub fn consume_subject(&self) -> &str {
        &self.context.consume_subject
    }

    /// Subject this stage republishes to.
    #[must_use]
    pub fn publish_subject(&self) -> &str {
        &self.context.publish_subject
    }

    /// How long each message is held.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.context.delay
    }

    /// Durable name of the stage subscription.
    #[must_use]
    pub fn durable_name(&self) -> String {
        format!("{}-durable", self.context.consume_subject)
    }

    /// Ack-wait of the stage subscription: the delay plus [`ACK_WAIT_MARGIN`].
    #[must_use]
    pub fn ack_wait(&self) -> Duration {
        self.context.delay.saturating_add(ACK_WAIT_MARGIN)
    }

    /// Whether the stage is consuming.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Open the durable, manually acknowledged stage subscription and start
    /// holding messages. Starting a running stage is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the subscription cannot be opened.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let options = SubscriptionOptions::new()
            .durable(self.durable_name())
            .manual_ack()
            .ack_wait(self.ack_wait())
            .start_at(StartPosition::LastReceived);
        let subscription = self
            .context
            .connection
            .subscribe(&self.context.consume_subject, options)
            .await?;

        let (cancel, cancelled) = watch::channel(false);
        tokio::spawn(run_stage(
            Arc::clone(&self.context),
            subscription.messages,
            cancelled,
        ));
        *running = Some(RunningStage {
            handle: subscription.handle,
            cancel,
        });

        tracing::info!(
            stage = %self.context.consume_subject,
            target = %self.context.publish_subject,
            delay_ms = u64::try_from(self.context.delay.as_millis()).unwrap_or(u64::MAX),
            "Retry stage started"
        );
        Ok(())
    }

    /// Stop consuming. Messages still waiting out their delay are abandoned
    /// unacknowledged, so the durable subscription hands them out again on the
    /// next start. Stopping a stopped stage is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the subscription cannot be closed. A
    /// subscription that is already gone (its connection was closed) is not an
    /// error.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let Some(stage) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = stage.cancel.send(true);
        match stage.handle.close().await {
            Ok(()) | Err(TransportError::SubscriptionClosed(_)) => {},
            Err(error) => return Err(error),
        }

        tracing::info!(stage = %self.context.consume_subject, "Retry stage stopped");
        Ok(())
    }
}

async fn run_stage(
    context: Arc<StageContext>,
    mut messages: MessageStream,
    cancelled: watch::Receiver<bool>,
) {
    while let Some(delivery) = messages.next().await {
        match delivery {
            Ok(message) => {
                tokio::spawn(delayed_publish(
                    Arc::clone(&context),
                    message,
                    cancelled.clone(),
                ));
            },
            Err(error) => {
                tracing::warn!(stage = %context.consume_subject, error = %error, "Delivery error");
            },
        }
    }
}

async fn delayed_publish(
    context: Arc<StageContext>,
    message: Message,
    mut cancelled: watch::Receiver<bool>,
) {
    tokio::select! {
        () = tokio::time::sleep(context.delay) => {}
        () = wait_cancelled(&mut cancelled) => {
            tracing::debug!(
                stage = %context.consume_subject,
                sequence = message.sequence(),
                "Delayed publish cancelled"
            );
            return;
        }
    }

    if !context.connection.is_connected() {
        // Left unacknowledged; the transport redelivers it.
        tracing::warn!(
            stage = %context.consume_subject,
            sequence = message.sequence(),
            "Connection is down, leaving message for redelivery"
        );
        return;
    }

    let failure = |error: TransportError| RetryFailure {
        stage: context.consume_subject.clone(),
        target: context.publish_subject.clone(),
        sequence: message.sequence(),
        error,
    };

    if let Err(error) = context
        .connection
        .publish(&context.publish_subject, message.data().to_vec())
        .await
    {
        (context.on_failure)(failure(error));
        return;
    }
    OctopusMetrics::record_retry_redelivered(&context.consume_subject);

    if let Err(error) = message.ack().await {
        (context.on_failure)(failure(error));
        return;
    }

    tracing::debug!(
        stage = %context.consume_subject,
        target = %context.publish_subject,
        sequence = message.sequence(),
        "Message republished"
    );
}

/// Resolves once cancellation is signalled or the signal's sender is gone.
async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    loop {
        let is_cancelled = *cancelled.borrow_and_update();
        if is_cancelled {
            return;
        }
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}

/// The ordered set of retry stages.
pub struct RetryPipeline {
    stages: Vec<DelayedConsumer>,
}

/// Build `stage_count` stages: stage `i` consumes `"{consume_subject_base}-{i}"`,
/// waits `base_delay * exponent^i` and republishes onto `publish_target`.
#[must_use]
pub fn build_retry_pipeline(
    consume_subject_base: &str,
    publish_target: &str,
    stage_count: u32,
    base_delay: Duration,
    exponent: u32,
    connection: Arc<dyn Connection>,
    on_failure: FailureHandler,
) -> RetryPipeline {
    let stages = (0..stage_count)
        .map(|stage| {
            DelayedConsumer::new(
                retry_stage(consume_subject_base, stage),
                publish_target,
                stage_delay(base_delay, exponent, stage),
                Arc::clone(&connection),
                Arc::clone(&on_failure),
            )
        })
        .collect();

    RetryPipeline { stages }
}

impl RetryPipeline {
    /// The stages, in order.
    #[must_use]
    pub fn stages(&self) -> &[DelayedConsumer] {
        &self.stages
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Start every stage.
    ///
    /// # Errors
    ///
    /// Returns the first stage's start error; stages started before it are
    /// stopped again.
    pub async fn start(&self) -> Result<(), TransportError> {
        for (index, stage) in self.stages.iter().enumerate() {
            if let Err(error) = stage.start().await {
                for started in &self.stages[..index] {
                    if let Err(stop_error) = started.stop().await {
                        tracing::warn!(
                            stage = %started.consume_subject(),
                            error = %stop_error,
                            "Failed to stop retry stage"
                        );
                    }
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Stop every stage. Failures are logged.
    pub async fn stop(&self) {
        for stage in &self.stages {
            if let Err(error) = stage.stop().await {
                tracing::warn!(
                    stage = %stage.consume_subject(),
                    error = %error,
                    "Failed to stop retry stage"
                );
            }
        }
    }
}
