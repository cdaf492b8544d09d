//! Queue events emitted by the worker pool.
//!
//! Consumers subscribe for logging, metrics, or alerting; the pool keeps
//! functioning whether or not anyone is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Job;

/// An event observed on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A handler finished successfully and the job is terminal.
    Completed { job: Job },

    /// A handler attempt failed. The job's state tells whether it was
    /// rescheduled (`waiting`) or is permanently failed.
    Failed { job: Job, error: String },

    /// A pool-level fault — typically store connectivity loss. The pool
    /// logs it, backs off, and keeps running.
    Error {
        message: String,
        at: DateTime<Utc>,
    },
}
