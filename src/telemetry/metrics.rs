//! Metric instrument factories for drcal-jobs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"drcal-jobs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for drcal-jobs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("drcal-jobs")
}

/// Counter: number of jobs submitted.
/// Labels: `kind`, `result` ("ok" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("drcal.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("drcal.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: queue-level operations (claim, claim_empty, stats).
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("drcal.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: handler execution duration in milliseconds.
/// Labels: `kind`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("drcal.handler.duration_ms")
        .with_description("Handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: advisory lock acquisition attempts.
/// Labels: `result` ("acquired" | "contended").
pub fn lock_attempts() -> Counter<u64> {
    meter()
        .u64_counter("drcal.locks.attempts")
        .with_description("Advisory lock acquisition attempts")
        .build()
}

/// Counter: jobs retired by terminal outcome.
/// Labels: `outcome` ("completed" | "failed" | "waiting" for retries).
pub fn jobs_retired() -> Counter<u64> {
    meter()
        .u64_counter("drcal.jobs.retired")
        .with_description("Job attempts retired, by outcome state")
        .build()
}
