use thiserror::Error;

use crate::steps::StepName;

/// Errors a step may return. Anything that isn't a dependency outage is
/// treated as a failure of this particular event.
#[derive(Debug, Error)]
pub enum StepError {
    // A store or service we don't own is unreachable. The whole invocation
    // must be retried later, so these never reach the dead letter queue.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(#[source] anyhow::Error),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl StepError {
    pub fn dependency_unavailable(error: impl Into<anyhow::Error>) -> Self {
        StepError::DependencyUnavailable(error.into())
    }

    pub fn is_dependency_unavailable(&self) -> bool {
        matches!(self, StepError::DependencyUnavailable(_))
    }
}

/// Errors surfaced to the caller of a pipeline. Receiving one of these means
/// the event was NOT processed and should not be acknowledged.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dependency unavailable in step {step}: {source}")]
    DependencyUnavailable {
        step: StepName,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to resolve person before step {step}: {source}")]
    PersonResolution {
        step: StepName,
        #[source]
        source: PersonError,
    },
}

#[derive(Debug, Error)]
pub enum PersonError {
    #[error("person store unavailable: {0}")]
    DependencyUnavailable(#[source] anyhow::Error),
    #[error("person lookup failed: {0}")]
    LookupFailed(#[source] anyhow::Error),
}

impl From<PersonError> for StepError {
    fn from(error: PersonError) -> Self {
        match error {
            PersonError::DependencyUnavailable(source) => StepError::DependencyUnavailable(source),
            other => StepError::Failed(other.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to serialize dead letter envelope: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}
