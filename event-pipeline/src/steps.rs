//! The steps an event goes through, and the contract a step implementation
//! has to satisfy.
//!
//! Steps never call each other. A step returns the next [`Step`] to run, with
//! that step's arguments, or `None` when there is nothing left to do. The
//! runner owns the loop, which keeps every step callable on its own with
//! hand-built arguments.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::StepError;
use crate::event::{OriginalEvent, PipelineEvent, PluginEvent, PostIngestionEvent, PreIngestionEvent};
use crate::person::PersonContainer;
use crate::runner::PipelineContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    PopulateTeamData,
    EmitToBuffer,
    PluginsProcessEvent,
    ProcessPersons,
    PrepareEvent,
    CreateEvent,
    RunAsyncHandlers,
}

impl StepName {
    pub const ALL: [StepName; 7] = [
        StepName::PopulateTeamData,
        StepName::EmitToBuffer,
        StepName::PluginsProcessEvent,
        StepName::ProcessPersons,
        StepName::PrepareEvent,
        StepName::CreateEvent,
        StepName::RunAsyncHandlers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::PopulateTeamData => "populate_team_data",
            StepName::EmitToBuffer => "emit_to_buffer",
            StepName::PluginsProcessEvent => "plugins_process_event",
            StepName::ProcessPersons => "process_persons",
            StepName::PrepareEvent => "prepare_event",
            StepName::CreateEvent => "create_event",
            StepName::RunAsyncHandlers => "run_async_handlers",
        }
    }

    /// Whether a failure in this step sends the originating event to the dead
    /// letter queue. Async handlers run after the event has been written, so
    /// their failures must not make the event look unprocessed.
    pub fn emits_to_dead_letter_queue(&self) -> bool {
        !matches!(self, StepName::RunAsyncHandlers)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step to run next, carrying its arguments.
#[derive(Debug)]
pub enum Step {
    PopulateTeamData(PipelineEvent),
    EmitToBuffer(PluginEvent),
    PluginsProcessEvent(PluginEvent, PersonContainer),
    ProcessPersons(PluginEvent, PersonContainer),
    PrepareEvent(PluginEvent, PersonContainer),
    CreateEvent(PreIngestionEvent, PersonContainer),
    RunAsyncHandlers(PostIngestionEvent, PersonContainer),
}

/// `None` means the pipeline is done.
pub type StepResult = Option<Step>;

impl Step {
    pub fn name(&self) -> StepName {
        match self {
            Step::PopulateTeamData(..) => StepName::PopulateTeamData,
            Step::EmitToBuffer(..) => StepName::EmitToBuffer,
            Step::PluginsProcessEvent(..) => StepName::PluginsProcessEvent,
            Step::ProcessPersons(..) => StepName::ProcessPersons,
            Step::PrepareEvent(..) => StepName::PrepareEvent,
            Step::CreateEvent(..) => StepName::CreateEvent,
            Step::RunAsyncHandlers(..) => StepName::RunAsyncHandlers,
        }
    }

    /// The team the step's event belongs to, if it has been resolved yet.
    pub fn team_id(&self) -> Option<i32> {
        match self {
            Step::PopulateTeamData(event) => event.team_id,
            Step::EmitToBuffer(event)
            | Step::PluginsProcessEvent(event, _)
            | Step::ProcessPersons(event, _)
            | Step::PrepareEvent(event, _) => Some(event.team_id),
            Step::CreateEvent(event, _) => Some(event.team_id),
            Step::RunAsyncHandlers(event, _) => Some(event.team_id),
        }
    }

    /// Arguments as JSON, for results, logs and error reports. Person
    /// containers serialize to their projection.
    pub fn serialize_args(&self) -> Vec<Value> {
        match self {
            Step::PopulateTeamData(event) => vec![to_value(event)],
            Step::EmitToBuffer(event) => vec![to_value(event)],
            Step::PluginsProcessEvent(event, person)
            | Step::ProcessPersons(event, person)
            | Step::PrepareEvent(event, person) => vec![to_value(event), to_value(person)],
            Step::CreateEvent(event, person) => vec![to_value(event), to_value(person)],
            Step::RunAsyncHandlers(event, person) => vec![to_value(event), to_value(person)],
        }
    }
}

fn to_value<T: Serialize>(arg: &T) -> Value {
    serde_json::to_value(arg).unwrap_or_else(|e| json!({ "unserializable": e.to_string() }))
}

/// What a step gets to see of the invocation it runs in.
pub struct RunnerContext {
    pub pipeline: Arc<PipelineContext>,
    pub original_event: Arc<OriginalEvent>,
}

impl RunnerContext {
    pub fn new(pipeline: Arc<PipelineContext>, original_event: impl Into<OriginalEvent>) -> Self {
        RunnerContext {
            pipeline,
            original_event: Arc::new(original_event.into()),
        }
    }

    /// A fresh, unresolved person container for this invocation.
    pub fn person_container(&self, team_id: i32, distinct_id: &str) -> PersonContainer {
        PersonContainer::new(team_id, distinct_id, self.pipeline.persons.clone())
    }
}

/// The step registry. Every step has to be provided, so a pipeline can't be
/// built with a step missing.
///
/// Steps may be called again with the same arguments when a caller retries an
/// invocation that failed with a dependency outage, so they must not assume
/// they run exactly once.
#[async_trait]
pub trait EventPipelineSteps: Send + Sync {
    async fn populate_team_data(
        &self,
        runner: &RunnerContext,
        event: PipelineEvent,
    ) -> Result<StepResult, StepError>;

    async fn emit_to_buffer(
        &self,
        runner: &RunnerContext,
        event: PluginEvent,
    ) -> Result<StepResult, StepError>;

    async fn plugins_process_event(
        &self,
        runner: &RunnerContext,
        event: PluginEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError>;

    async fn process_persons(
        &self,
        runner: &RunnerContext,
        event: PluginEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError>;

    async fn prepare_event(
        &self,
        runner: &RunnerContext,
        event: PluginEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError>;

    async fn create_event(
        &self,
        runner: &RunnerContext,
        event: PreIngestionEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError>;

    async fn run_async_handlers(
        &self,
        runner: &RunnerContext,
        event: PostIngestionEvent,
        person: PersonContainer,
    ) -> Result<StepResult, StepError>;
}

pub(crate) async fn dispatch<S>(
    steps: &S,
    runner: &RunnerContext,
    step: Step,
) -> Result<StepResult, StepError>
where
    S: EventPipelineSteps + ?Sized,
{
    match step {
        Step::PopulateTeamData(event) => steps.populate_team_data(runner, event).await,
        Step::EmitToBuffer(event) => steps.emit_to_buffer(runner, event).await,
        Step::PluginsProcessEvent(event, person) => {
            steps.plugins_process_event(runner, event, person).await
        }
        Step::ProcessPersons(event, person) => steps.process_persons(runner, event, person).await,
        Step::PrepareEvent(event, person) => steps.prepare_event(runner, event, person).await,
        Step::CreateEvent(event, person) => steps.create_event(runner, event, person).await,
        Step::RunAsyncHandlers(event, person) => {
            steps.run_async_handlers(runner, event, person).await
        }
    }
}
