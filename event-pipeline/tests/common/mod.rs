#![allow(dead_code)]

use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use event_pipeline::dead_letter::{DeadLetterEmitter, DeadLetterEnvelope};
use event_pipeline::telemetry::{ExceptionReporter, Tags, TelemetrySink};
use event_pipeline::{
    DeadLetterError, EventPipelineRunner, EventPipelineSteps, Person, PersonContainer,
    PersonError, PersonProvider, PipelineContext, PipelineEvent, PluginEvent, PostIngestionEvent,
    PreIngestionEvent, Properties, RunnerContext, Step, StepError, StepName, StepResult,
};
use serde_json::{json, Value};
use uuid::Uuid;

pub const TEAM_ID: i32 = 2;

/// Collects formatted log lines so tests can assert on what was logged.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's events into the capture until the guard drops.
    /// Tasks spawned on a current-thread runtime log here too.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    pub increments: Mutex<Vec<(&'static str, Vec<(String, String)>)>>,
    pub timings: Mutex<Vec<(&'static str, Vec<(String, String)>)>>,
}

impl RecordingTelemetry {
    pub fn count(&self, name: &str) -> usize {
        self.increments
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .count()
    }

    pub fn tags(&self, name: &str) -> Vec<Vec<(String, String)>> {
        self.increments
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, tags)| tags.clone())
            .collect()
    }

    pub fn timing_count(&self, name: &str) -> usize {
        self.timings
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .count()
    }
}

fn owned(tags: &Tags) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

impl TelemetrySink for RecordingTelemetry {
    fn increment(&self, name: &'static str, tags: &Tags) {
        self.increments.lock().unwrap().push((name, owned(tags)));
    }

    fn timing(&self, name: &'static str, _start: Instant, tags: &Tags) {
        self.timings.lock().unwrap().push((name, owned(tags)));
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(String, Value)>>,
}

impl RecordingReporter {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl ExceptionReporter for RecordingReporter {
    fn report(&self, error: &(dyn Error + 'static), context: &Value) {
        self.reports
            .lock()
            .unwrap()
            .push((error.to_string(), context.clone()));
    }
}

#[derive(Default)]
pub struct RecordingDeadLetter {
    pub submitted: Mutex<Vec<DeadLetterEnvelope>>,
    pub fail: bool,
}

impl RecordingDeadLetter {
    pub fn failing() -> Self {
        RecordingDeadLetter {
            submitted: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn envelopes(&self) -> Vec<DeadLetterEnvelope> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterEmitter for RecordingDeadLetter {
    async fn submit(&self, envelope: DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        self.submitted.lock().unwrap().push(envelope);
        if self.fail {
            return Err(DeadLetterError::Canceled);
        }
        Ok(())
    }
}

/// Serves persons from a map, or fails every lookup when `unavailable`.
#[derive(Default)]
pub struct StaticPersons {
    pub persons: HashMap<(i32, String), Person>,
    pub unavailable: bool,
    pub lookups: AtomicUsize,
}

impl StaticPersons {
    pub fn with_person(team_id: i32, distinct_id: &str) -> Self {
        let person = Person {
            id: 1,
            uuid: Uuid::now_v7(),
            team_id,
            properties: json!({}),
            is_identified: false,
            created_at: Utc::now(),
            version: Some(0),
        };
        StaticPersons {
            persons: HashMap::from([((team_id, distinct_id.to_string()), person)]),
            ..Default::default()
        }
    }

    pub fn unavailable() -> Self {
        StaticPersons {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonProvider for StaticPersons {
    async fn fetch(&self, team_id: i32, distinct_id: &str) -> Result<Option<Person>, PersonError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(PersonError::DependencyUnavailable(anyhow::anyhow!(
                "connection refused"
            )));
        }
        Ok(self
            .persons
            .get(&(team_id, distinct_id.to_string()))
            .cloned())
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Finish,
    Fail(&'static str),
    Unavailable(&'static str),
    Stall(Duration),
}

/// Steps that walk the live ingestion chain, recording every call. Any step
/// can be overridden to stop, fail or stall.
#[derive(Default)]
pub struct ScriptedSteps {
    pub overrides: HashMap<StepName, Behavior>,
    pub calls: Mutex<Vec<StepName>>,
}

impl ScriptedSteps {
    pub fn with(overrides: impl IntoIterator<Item = (StepName, Behavior)>) -> Self {
        ScriptedSteps {
            overrides: overrides.into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<StepName> {
        self.calls.lock().unwrap().clone()
    }

    // Returns Some when the override decides the outcome on its own
    async fn enter(&self, step: StepName) -> Option<Result<StepResult, StepError>> {
        self.calls.lock().unwrap().push(step);
        match self.overrides.get(&step)? {
            Behavior::Finish => Some(Ok(None)),
            Behavior::Fail(message) => Some(Err(anyhow::anyhow!(*message).into())),
            Behavior::Unavailable(message) => Some(Err(StepError::dependency_unavailable(
                anyhow::anyhow!(*message),
            ))),
            Behavior::Stall(duration) => {
                tokio::time::sleep(*duration).await;
                None
            }
        }
    }
}

#[async_trait]
impl EventPipelineSteps for ScriptedSteps {
    async fn populate_team_data(
        &self,
        _runner: &RunnerContext,
        event: PipelineEvent,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::PopulateTeamData).await {
            return outcome;
        }
        let team_id = event.team_id.unwrap_or(TEAM_ID);
        Ok(Some(Step::EmitToBuffer(event.into_plugin_event(team_id))))
    }

    async fn emit_to_buffer(
        &self,
        runner: &RunnerContext,
        event: PluginEvent,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::EmitToBuffer).await {
            return outcome;
        }
        let person = runner.person_container(event.team_id, &event.distinct_id);
        Ok(Some(Step::PluginsProcessEvent(event, person)))
    }

    async fn plugins_process_event(
        &self,
        _runner: &RunnerContext,
        mut event: PluginEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::PluginsProcessEvent).await {
            return outcome;
        }
        person.get().await?;
        event
            .properties
            .insert("$plugins_succeeded".to_string(), json!(["geoip"]));
        Ok(Some(Step::ProcessPersons(event, person)))
    }

    async fn process_persons(
        &self,
        _runner: &RunnerContext,
        event: PluginEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::ProcessPersons).await {
            return outcome;
        }
        Ok(Some(Step::PrepareEvent(event, person)))
    }

    async fn prepare_event(
        &self,
        _runner: &RunnerContext,
        event: PluginEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::PrepareEvent).await {
            return outcome;
        }
        let timestamp = event.resolved_timestamp(Utc::now());
        let prepared = PreIngestionEvent {
            uuid: event.uuid,
            event: event.event,
            distinct_id: event.distinct_id,
            team_id: event.team_id,
            ip: event.ip,
            properties: event.properties,
            timestamp,
            elements_chain: event.elements_chain,
        };
        Ok(Some(Step::CreateEvent(prepared, person)))
    }

    async fn create_event(
        &self,
        _runner: &RunnerContext,
        _event: PreIngestionEvent,
        _person: PersonContainer,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::CreateEvent).await {
            return outcome;
        }
        Ok(None)
    }

    async fn run_async_handlers(
        &self,
        _runner: &RunnerContext,
        _event: PostIngestionEvent,
        _person: PersonContainer,
    ) -> Result<StepResult, StepError> {
        if let Some(outcome) = self.enter(StepName::RunAsyncHandlers).await {
            return outcome;
        }
        Ok(None)
    }
}

pub struct Harness {
    pub telemetry: Arc<RecordingTelemetry>,
    pub reporter: Arc<RecordingReporter>,
    pub dead_letter: Arc<RecordingDeadLetter>,
    pub persons: Arc<StaticPersons>,
    pub steps: Arc<ScriptedSteps>,
    pub runner: EventPipelineRunner<ScriptedSteps>,
}

pub struct HarnessBuilder {
    steps: ScriptedSteps,
    dead_letter: RecordingDeadLetter,
    persons: StaticPersons,
    step_timeout_warning: Duration,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        HarnessBuilder {
            steps: ScriptedSteps::default(),
            dead_letter: RecordingDeadLetter::default(),
            persons: StaticPersons::default(),
            step_timeout_warning: Duration::from_secs(30),
        }
    }

    pub fn steps(mut self, steps: ScriptedSteps) -> Self {
        self.steps = steps;
        self
    }

    pub fn dead_letter(mut self, dead_letter: RecordingDeadLetter) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn persons(mut self, persons: StaticPersons) -> Self {
        self.persons = persons;
        self
    }

    pub fn step_timeout_warning(mut self, threshold: Duration) -> Self {
        self.step_timeout_warning = threshold;
        self
    }

    pub fn build(self) -> Harness {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let reporter = Arc::new(RecordingReporter::default());
        let dead_letter = Arc::new(self.dead_letter);
        let persons = Arc::new(self.persons);
        let steps = Arc::new(self.steps);

        let context = Arc::new(PipelineContext {
            step_timeout_warning: self.step_timeout_warning,
            telemetry: telemetry.clone(),
            exceptions: reporter.clone(),
            dead_letter: dead_letter.clone(),
            persons: persons.clone(),
        });

        Harness {
            runner: EventPipelineRunner::new(context, steps.clone()),
            telemetry,
            reporter,
            dead_letter,
            persons,
            steps,
        }
    }
}

pub fn properties(value: Value) -> Properties {
    value.as_object().cloned().unwrap_or_default()
}

pub fn plugin_event() -> PluginEvent {
    PluginEvent {
        uuid: Uuid::now_v7(),
        distinct_id: "user-1".to_string(),
        ip: Some("127.0.0.1".to_string()),
        site_url: "https://example.com".to_string(),
        team_id: TEAM_ID,
        now: "2024-01-01T12:00:10Z".to_string(),
        event: "$pageview".to_string(),
        properties: properties(json!({"$current_url": "https://example.com/pricing"})),
        timestamp: Some("2024-01-01T12:00:00Z".to_string()),
        offset: None,
        sent_at: Some("2024-01-01T12:00:05Z".to_string()),
        elements_chain: None,
    }
}

pub fn pipeline_event() -> PipelineEvent {
    PipelineEvent {
        uuid: Uuid::now_v7(),
        distinct_id: "user-1".to_string(),
        ip: Some("127.0.0.1".to_string()),
        site_url: "https://example.com".to_string(),
        team_id: None,
        token: Some("phc_abc".to_string()),
        now: "2024-01-01T12:00:10Z".to_string(),
        event: "$pageview".to_string(),
        properties: properties(json!({"$current_url": "https://example.com/pricing"})),
        timestamp: Some("2024-01-01T12:00:00Z".to_string()),
        offset: None,
        sent_at: None,
    }
}

pub fn post_ingestion_event() -> PostIngestionEvent {
    PostIngestionEvent {
        uuid: Uuid::now_v7(),
        event: "$pageview".to_string(),
        distinct_id: "user-1".to_string(),
        team_id: TEAM_ID,
        properties: properties(json!({"$current_url": "https://example.com/pricing"})),
        timestamp: Utc::now(),
        elements_chain: None,
        person_id: None,
    }
}

pub fn tag<'a>(tags: &'a [(String, String)], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
