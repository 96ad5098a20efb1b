use std::error::Error;
use std::time::Instant;

use serde_json::Value;
use tracing::error;

pub type Tags = [(&'static str, String)];

/// Where counters and timings go. Calls are fire-and-forget.
pub trait TelemetrySink: Send + Sync {
    fn increment(&self, name: &'static str, tags: &Tags);

    fn timing(&self, name: &'static str, start: Instant, tags: &Tags);
}

/// Records through the `metrics` facade, so whatever recorder the host
/// installed (prometheus, usually) picks them up.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn increment(&self, name: &'static str, tags: &Tags) {
        metrics::counter!(name, tags).increment(1);
    }

    fn timing(&self, name: &'static str, start: Instant, tags: &Tags) {
        metrics::histogram!(name, tags).record(start.elapsed().as_millis() as f64);
    }
}

/// Receives errors worth a human looking at, with whatever context the caller
/// has. Fire-and-forget.
pub trait ExceptionReporter: Send + Sync {
    fn report(&self, error: &(dyn Error + 'static), context: &Value);
}

/// Reports by logging at error level, including the source chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExceptionReporter;

impl ExceptionReporter for LogExceptionReporter {
    fn report(&self, error: &(dyn Error + 'static), context: &Value) {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        error!(
            error = %error,
            causes = ?causes,
            context = %context,
            "captured exception"
        );
    }
}
