use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rdkafka::error::KafkaError;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::config::Config;
use crate::dead_letter::{create_kafka_producer, DeadLetterEmitter, DeadLetterEnvelope, KafkaDeadLetterEmitter};
use crate::error::{PersonError, PipelineError, StepError};
use crate::event::{PipelineEvent, PluginEvent, PostIngestionEvent};
use crate::metric_consts::{
    DEAD_LETTER_ADDED, DEAD_LETTER_FAILED, PIPELINE_STARTED, PIPELINE_TIME,
    PROCESSED_AND_INGESTED, STEP_COMPLETED, STEP_ERROR, STEP_LAST, STEP_TIME,
};
use crate::person::PersonProvider;
use crate::steps::{dispatch, EventPipelineSteps, RunnerContext, Step, StepName, StepResult};
use crate::telemetry::{ExceptionReporter, LogExceptionReporter, MetricsTelemetry, TelemetrySink};
use crate::timeout::TimeoutGuard;

const STEP_STALLED_MESSAGE: &str = "Event pipeline step stalled";

/// Collaborators shared by every invocation.
pub struct PipelineContext {
    pub step_timeout_warning: Duration,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub exceptions: Arc<dyn ExceptionReporter>,
    pub dead_letter: Arc<dyn DeadLetterEmitter>,
    pub persons: Arc<dyn PersonProvider>,
}

impl PipelineContext {
    /// Production wiring: `metrics` facade counters, logged exceptions and a Kafka
    /// dead letter topic.
    pub fn from_config(
        config: &Config,
        persons: Arc<dyn PersonProvider>,
    ) -> Result<Self, KafkaError> {
        let producer = create_kafka_producer(&config.kafka)?;

        Ok(PipelineContext {
            step_timeout_warning: config.step_timeout_warning(),
            telemetry: Arc::new(MetricsTelemetry),
            exceptions: Arc::new(LogExceptionReporter),
            dead_letter: Arc::new(KafkaDeadLetterEmitter::new(
                producer,
                &config.dead_letter_queue_topic,
            )),
            persons,
        })
    }
}

/// How far an invocation got. A result with an `error` still means the event
/// was handled, it just failed; outages come back as `PipelineError` instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPipelineResult {
    pub last_step: StepName,
    pub args: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventPipelineResult {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    LightweightCapture,
    Event,
    Buffer,
    AsyncHandlers,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::LightweightCapture => "lightweight_capture",
            PipelineKind::Event => "event",
            PipelineKind::Buffer => "buffer",
            PipelineKind::AsyncHandlers => "async_handlers",
        }
    }
}

/// Drives events through the steps in `S`.
///
/// The runner holds no per-event state, clone it freely and run invocations
/// concurrently. Within one invocation steps run strictly one after another.
pub struct EventPipelineRunner<S: ?Sized> {
    context: Arc<PipelineContext>,
    steps: Arc<S>,
}

impl<S: ?Sized> Clone for EventPipelineRunner<S> {
    fn clone(&self) -> Self {
        EventPipelineRunner {
            context: self.context.clone(),
            steps: self.steps.clone(),
        }
    }
}

impl<S> EventPipelineRunner<S>
where
    S: EventPipelineSteps + ?Sized,
{
    pub fn new(context: Arc<PipelineContext>, steps: Arc<S>) -> Self {
        EventPipelineRunner { context, steps }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Capture events that skip the early persistence lookups.
    pub async fn run_lightweight_capture_pipeline(
        &self,
        event: PipelineEvent,
    ) -> Result<EventPipelineResult, PipelineError> {
        let kind = PipelineKind::LightweightCapture;
        let start = self.pipeline_started(kind);

        let runner = RunnerContext::new(self.context.clone(), event.clone());
        let result = self.run_pipeline(&runner, Step::PopulateTeamData(event)).await?;

        self.pipeline_processed(kind, start, Vec::new());
        Ok(result)
    }

    /// The standard ingestion path.
    pub async fn run_event_pipeline(
        &self,
        event: PluginEvent,
    ) -> Result<EventPipelineResult, PipelineError> {
        let kind = PipelineKind::Event;
        let start = self.pipeline_started(kind);

        let runner = RunnerContext::new(self.context.clone(), event.clone());
        let result = self.run_pipeline(&runner, Step::EmitToBuffer(event)).await?;

        self.pipeline_processed(kind, start, Vec::new());
        Ok(result)
    }

    /// Events coming back out of the buffer. The person is looked up before
    /// anything runs, to track how often buffering paid off.
    pub async fn run_buffer_event_pipeline(
        &self,
        event: PluginEvent,
    ) -> Result<EventPipelineResult, PipelineError> {
        let kind = PipelineKind::Buffer;
        let start = self.pipeline_started(kind);

        let runner = RunnerContext::new(self.context.clone(), event.clone());
        let person = runner.person_container(event.team_id, &event.distinct_id);
        let did_person_exist_at_start = person
            .get()
            .await
            .map_err(|e| person_resolution_error(StepName::PluginsProcessEvent, e))?
            .is_some();

        let result = self
            .run_pipeline(&runner, Step::PluginsProcessEvent(event, person))
            .await?;

        self.pipeline_processed(
            kind,
            start,
            vec![(
                "did_person_exist_at_start",
                did_person_exist_at_start.to_string(),
            )],
        );
        Ok(result)
    }

    /// Side effects (exports, webhooks) for an event that is already stored.
    pub async fn run_async_handlers_pipeline(
        &self,
        event: PostIngestionEvent,
    ) -> Result<EventPipelineResult, PipelineError> {
        let kind = PipelineKind::AsyncHandlers;
        let start = self.pipeline_started(kind);

        let runner = RunnerContext::new(self.context.clone(), event.clone());
        let person = runner.person_container(event.team_id, &event.distinct_id);
        let result = self
            .run_pipeline(&runner, Step::RunAsyncHandlers(event, person))
            .await?;

        self.pipeline_processed(kind, start, Vec::new());
        Ok(result)
    }

    /// Run steps starting at `first` until one returns `None` or fails.
    ///
    /// Step failures are logged, reported and, for steps that allow it, dead
    /// lettered; they come back as a result with `error` set. Only dependency
    /// outages are returned as `Err`, since the invocation has to be retried.
    pub async fn run_pipeline(
        &self,
        runner: &RunnerContext,
        first: Step,
    ) -> Result<EventPipelineResult, PipelineError> {
        let mut current = first;

        loop {
            let step = current.name();
            // Steps take their arguments by value, so snapshot them for the
            // result before handing them over.
            let args = current.serialize_args();
            let team_id = current.team_id().or_else(|| runner.original_event.team_id());

            match self.run_step(runner, current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    let team_id = team_id.map(|id| id.to_string()).unwrap_or_default();
                    self.context.telemetry.increment(
                        STEP_LAST,
                        &[("step", step.to_string()), ("team_id", team_id)],
                    );

                    return Ok(EventPipelineResult {
                        last_step: step,
                        args,
                        error: None,
                    });
                }
                Err(error) => return self.handle_error(runner, step, args, error).await,
            }
        }
    }

    async fn run_step(&self, runner: &RunnerContext, step: Step) -> Result<StepResult, StepError> {
        let name = step.name();
        let start = Instant::now();

        let original_event = runner.original_event.clone();
        let guard = TimeoutGuard::start(
            STEP_STALLED_MESSAGE,
            self.context.step_timeout_warning,
            move || json!({ "step": name.as_str(), "event": original_event.as_ref() }),
        );

        let result = dispatch(self.steps.as_ref(), runner, step).await;

        if guard.fired() {
            warn!(
                step = %name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "stalled step eventually completed"
            );
        }
        drop(guard);

        if result.is_ok() {
            let tags = [("step", name.to_string())];
            self.context.telemetry.increment(STEP_COMPLETED, &tags);
            self.context.telemetry.timing(STEP_TIME, start, &tags);
        }

        result
    }

    async fn handle_error(
        &self,
        runner: &RunnerContext,
        step: StepName,
        args: Vec<Value>,
        error: StepError,
    ) -> Result<EventPipelineResult, PipelineError> {
        let context = json!({
            "step": step.as_str(),
            "serialized_args": &args,
            "original_event": runner.original_event.as_ref(),
        });

        error!(step = %step, error = %error, context = %context, "step_failed");
        self.context.exceptions.report(&error, &context);
        self.context
            .telemetry
            .increment(STEP_ERROR, &[("step", step.to_string())]);

        let message = match error {
            StepError::DependencyUnavailable(source) => {
                return Err(PipelineError::DependencyUnavailable { step, source });
            }
            StepError::Failed(error) => error.to_string(),
        };

        if step.emits_to_dead_letter_queue() {
            self.emit_to_dead_letter_queue(runner, step, &args, &message)
                .await;
        }

        Ok(EventPipelineResult {
            last_step: step,
            args,
            error: Some(message),
        })
    }

    async fn emit_to_dead_letter_queue(
        &self,
        runner: &RunnerContext,
        step: StepName,
        args: &[Value],
        message: &str,
    ) {
        let submitted = match DeadLetterEnvelope::from_failure(
            &runner.original_event,
            message,
            Utc::now(),
        ) {
            Ok(envelope) => self.context.dead_letter.submit(envelope).await,
            Err(e) => Err(e),
        };

        match submitted {
            Ok(()) => self.context.telemetry.increment(DEAD_LETTER_ADDED, &[]),
            Err(dlq_error) => {
                warn!(
                    step = %step,
                    error = %dlq_error,
                    "failed to add event to the dead letter queue"
                );
                self.context.exceptions.report(
                    &dlq_error,
                    &json!({
                        "step": step.as_str(),
                        "serialized_args": args,
                        "original_event": runner.original_event.as_ref(),
                        "error": message,
                    }),
                );
                self.context
                    .telemetry
                    .increment(DEAD_LETTER_FAILED, &[("step", step.to_string())]);
            }
        }
    }

    fn pipeline_started(&self, kind: PipelineKind) -> Instant {
        self.context
            .telemetry
            .increment(PIPELINE_STARTED, &[("pipeline", kind.as_str().to_string())]);
        Instant::now()
    }

    // Counts attempts, failed results included
    fn pipeline_processed(
        &self,
        kind: PipelineKind,
        start: Instant,
        mut tags: Vec<(&'static str, String)>,
    ) {
        tags.push(("pipeline", kind.as_str().to_string()));
        self.context.telemetry.increment(PROCESSED_AND_INGESTED, &tags);
        self.context
            .telemetry
            .timing(PIPELINE_TIME, start, &[("pipeline", kind.as_str().to_string())]);
    }
}

fn person_resolution_error(step: StepName, error: PersonError) -> PipelineError {
    match error {
        PersonError::DependencyUnavailable(source) => {
            PipelineError::DependencyUnavailable { step, source }
        }
        other => PipelineError::PersonResolution {
            step,
            source: other,
        },
    }
}
