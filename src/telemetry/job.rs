//! Job execution span helpers.
//!
//! Provides span creation and outcome recording for jobs flowing
//! through the worker pool.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::JobId;
use crate::telemetry::metrics;

/// Start a span wrapping one execution attempt of a job.
pub fn start_job_span(kind: &str, id: &JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = kind,
        "job.id" = %id,
        "job.attempt" = attempt,
    )
}

/// Record the outcome state an attempt retired into.
pub fn record_outcome(outcome: &'static str) {
    metrics::jobs_retired().add(1, &[KeyValue::new("outcome", outcome)]);
}
