//! In-memory store and lock service.
//!
//! Same ordering, retention, and state-machine semantics as the
//! Postgres implementations, minus durability. Intended for tests and
//! for running the pool without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, QueueStats, RetentionPolicy, State};
use crate::store::{LockGuard, LockService, QueueStore};

/// In-memory [`QueueStore`].
pub struct MemoryQueueStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    notify: Notify,
    retention: RetentionPolicy,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            retention,
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().expect("jobs mutex poisoned")
    }

    /// Keep only the newest `keep` jobs in `state`, by update time.
    fn prune(jobs: &mut HashMap<JobId, Job>, state: State, keep: usize) {
        let mut terminal: Vec<(JobId, chrono::DateTime<Utc>)> = jobs
            .values()
            .filter(|j| j.state == state)
            .map(|j| (j.id, j.updated_at))
            .collect();
        if terminal.len() <= keep {
            return;
        }
        terminal.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _) in terminal.into_iter().skip(keep) {
            jobs.remove(&id);
        }
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn submit(&self, new: NewJob) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            kind: new.kind.as_str().to_string(),
            payload: new.payload.clone(),
            priority: new.effective_priority(),
            state: State::Waiting,
            attempts_made: 0,
            max_attempts: new.max_attempts,
            backoff: new.backoff,
            run_at: now + new.delay,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.lock_jobs().insert(job.id, job.clone());
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.lock_jobs();

        // Lowest priority value first, then creation order. The id is a
        // final tiebreak to keep claims deterministic when timestamps
        // collide.
        let next = jobs
            .values()
            .filter(|j| j.state == State::Waiting && j.run_at <= now)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.0.cmp(&b.id.0))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        job.state = State::Active;
        job.attempts_made += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<Job> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if job.state != State::Active {
            return Err(Error::InvalidTransition {
                from: job.state,
                to: State::Completed,
            });
        }
        job.state = State::Completed;
        job.result = Some(result);
        job.updated_at = Utc::now();
        let done = job.clone();
        Self::prune(&mut jobs, State::Completed, self.retention.completed);
        Ok(done)
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Job> {
        let now = Utc::now();
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if job.state != State::Active {
            return Err(Error::InvalidTransition {
                from: job.state,
                to: State::Failed,
            });
        }
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        if job.attempts_made >= job.max_attempts {
            job.state = State::Failed;
            let dead = job.clone();
            Self::prune(&mut jobs, State::Failed, self.retention.failed);
            Ok(dead)
        } else {
            job.state = State::Waiting;
            job.run_at = now + job.backoff.delay(job.attempts_made);
            Ok(job.clone())
        }
    }

    async fn fail_permanently(&self, id: JobId, error: &str) -> Result<Job> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if job.state != State::Active {
            return Err(Error::InvalidTransition {
                from: job.state,
                to: State::Failed,
            });
        }
        job.state = State::Failed;
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        let dead = job.clone();
        Self::prune(&mut jobs, State::Failed, self.retention.failed);
        Ok(dead)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.lock_jobs()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn list(&self, state: Option<State>, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.lock_jobs();
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let jobs = self.lock_jobs();
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.state {
                State::Waiting => stats.waiting += 1,
                State::Active => stats.active += 1,
                State::Completed => stats.completed += 1,
                State::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::Other(format!("reclaim threshold out of range: {e}")))?;
        let mut jobs = self.lock_jobs();
        let mut reclaimed = 0u64;
        for job in jobs.values_mut() {
            if job.state == State::Active && job.updated_at < cutoff {
                job.state = State::Waiting;
                job.run_at = now;
                job.updated_at = now;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn wait_for_jobs(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

/// In-memory [`LockService`]: a set of held keys behind a mutex.
pub struct MemoryLockService {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Is `key` currently held? Test-visibility helper.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().expect("locks mutex poisoned").contains(key)
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str) -> Result<Option<Box<dyn LockGuard>>> {
        let mut held = self.held.lock().expect("locks mutex poisoned");
        if !held.insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLockGuard {
            key: key.to_string(),
            held: Arc::clone(&self.held),
            released: false,
        })))
    }
}

struct MemoryLockGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl MemoryLockGuard {
    fn unlock(&mut self) {
        if !self.released {
            self.held.lock().expect("locks mutex poisoned").remove(&self.key);
            self.released = true;
        }
    }
}

#[async_trait]
impl LockGuard for MemoryLockGuard {
    async fn release(mut self: Box<Self>) -> Result<()> {
        self.unlock();
        Ok(())
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}
