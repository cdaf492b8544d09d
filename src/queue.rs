//! Queue client: the enqueue surface handed to request handlers and
//! the ingestion adapter.
//!
//! An explicit value wrapping the store handle — pass it where it is
//! needed instead of reaching for a global. Submission failure is a
//! plain `Err(QueueUnavailable)`; whether that is fatal is the
//! caller's call (for CRUD request paths: log and continue).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::model::{Job, JobId, JobKind, NewJob, QueueStats, State};
use crate::store::QueueStore;

/// Options accepted by [`QueueClient::submit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Override the kind-default priority (appointments 1, notifications 2).
    pub priority: Option<i32>,
    /// Delay before the job becomes eligible. Default zero.
    pub delay: Option<Duration>,
}

/// Handle for enqueueing jobs and inspecting the queue.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn QueueStore>,
}

impl QueueClient {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Enqueue a job. On success the job exists in `waiting` state with
    /// its assigned id; on `QueueUnavailable` no record was created.
    pub async fn submit(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Job> {
        let mut new = NewJob::new(kind, payload);
        if let Some(priority) = options.priority {
            new = new.priority(priority);
        }
        if let Some(delay) = options.delay {
            new = new.delay(delay);
        }
        self.submit_job(new).await
    }

    /// Enqueue with full control over retry budget and backoff.
    pub async fn submit_job(&self, new: NewJob) -> Result<Job> {
        let kind = new.kind;
        let job = self.store.submit(new).await?;
        info!(id = %job.id, %kind, priority = job.priority, "job enqueued");
        Ok(job)
    }

    /// Queue depth by state (the queue inspector).
    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get(id).await
    }

    pub async fn list(&self, state: Option<State>, limit: i64) -> Result<Vec<Job>> {
        self.store.list(state, limit).await
    }
}
