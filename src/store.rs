//! Storage seams: the queue store and the advisory lock service.
//!
//! Both are object-safe async traits so the worker pool and the enqueue
//! client take explicit handles instead of module-level singletons, and
//! tests can inject the in-memory doubles from [`memory`].

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Job, JobId, NewJob, QueueStats, State};

/// Durable, shared storage for jobs.
///
/// The two coordination points across worker slots and processes are
/// `claim_next` (atomic pull: exactly one caller wins a given job) and
/// the lock service. Everything else is single-owner mutation by the
/// slot holding the `active` job.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new job in `waiting` state. Returns the created job
    /// with its assigned id.
    async fn submit(&self, new: NewJob) -> Result<Job>;

    /// Atomically pull the next eligible job and mark it `active`,
    /// incrementing `attempts_made`. Eligible means `waiting` with
    /// `run_at` in the past; lowest priority value wins, creation order
    /// breaks ties. Returns `None` when nothing is eligible.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// `active` → `completed`, storing the handler result. Prunes
    /// completed history beyond the retention bound.
    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<Job>;

    /// Record a failed attempt. Reschedules to `waiting` with the job's
    /// backoff delay, or moves to `failed` once `attempts_made` has
    /// reached `max_attempts`. Prunes failed history on the terminal
    /// path.
    async fn fail(&self, id: JobId, error: &str) -> Result<Job>;

    /// `active` → `failed` regardless of remaining attempts. Used for
    /// failures that can never succeed on retry (unroutable kind).
    async fn fail_permanently(&self, id: JobId, error: &str) -> Result<Job>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// List jobs, optionally filtered by state, newest first.
    async fn list(&self, state: Option<State>, limit: i64) -> Result<Vec<Job>>;

    /// Counts of jobs per state.
    async fn stats(&self) -> Result<QueueStats>;

    /// Return jobs stuck `active` longer than `older_than` to `waiting`
    /// so another slot can pick them up. Covers worker crashes
    /// mid-execution; returns how many were reclaimed.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64>;

    /// Block until new work may exist or `timeout` elapses. Purely an
    /// optimization over fixed-interval polling — spurious wakeups are
    /// fine.
    async fn wait_for_jobs(&self, timeout: Duration);
}

/// Named, non-blocking mutual exclusion.
///
/// At most one holder per key at a time. Acquisition reports success or
/// failure instead of queueing waiters; callers that need eventual
/// access rely on job retry. The backing primitive must bound lock
/// lifetime to a session or transaction so a crashed holder cannot
/// wedge the key.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempt to acquire the lock for `key`. `None` means another
    /// holder currently has it.
    async fn try_acquire(&self, key: &str) -> Result<Option<Box<dyn LockGuard>>>;
}

/// A held advisory lock. Released explicitly via [`release`] or
/// implicitly when dropped (including on panic/early-return paths).
///
/// [`release`]: LockGuard::release
#[async_trait]
pub trait LockGuard: Send {
    /// Release the lock now, reporting any backing-store error.
    async fn release(self: Box<Self>) -> Result<()>;
}
