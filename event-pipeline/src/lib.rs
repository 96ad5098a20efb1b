//! Step-chained processing core for ingested events.
//!
//! An [`EventPipelineRunner`] takes one event at a time through the steps of
//! an [`EventPipelineSteps`] implementation, starting at a step that depends on
//! where the event came from. Failures are classified: dependency outages go
//! back to the caller to retry, anything else is recorded, dead lettered where
//! the step allows it, and returned as a failed [`EventPipelineResult`].

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod historical_export;
pub mod metric_consts;
pub mod person;
pub mod runner;
pub mod steps;
pub mod telemetry;
pub mod timeout;
pub mod timestamp;

pub use error::{DeadLetterError, PersonError, PipelineError, StepError};
pub use event::{
    OriginalEvent, PipelineEvent, PluginEvent, PostIngestionEvent, PreIngestionEvent, Properties,
};
pub use person::{Person, PersonContainer, PersonProvider};
pub use runner::{EventPipelineResult, EventPipelineRunner, PipelineContext, PipelineKind};
pub use steps::{EventPipelineSteps, RunnerContext, Step, StepName, StepResult};
