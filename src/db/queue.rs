//! Postgres queue store: atomic claim via FOR UPDATE SKIP LOCKED,
//! NOTIFY-driven wakeup, bounded terminal-state retention.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{BackoffPolicy, Job, JobId, NewJob, QueueStats, RetentionPolicy, State};
use crate::store::QueueStore;
use crate::telemetry::metrics;

/// Channel used to wake pollers when new work lands.
const NOTIFY_CHANNEL: &str = "jobs_ready";

const JOB_COLUMNS: &str = "id, kind, payload, priority, state, attempts_made, max_attempts, \
     backoff_base_ms, run_at, last_error, result, created_at, updated_at";

/// Postgres implementation of [`QueueStore`].
pub struct PgQueueStore {
    pool: PgPool,
    retention: RetentionPolicy,
    // Lazily connected LISTEN session; rebuilt after connection loss.
    listener: Mutex<Option<PgListener>>,
}

impl PgQueueStore {
    pub fn new(db: &Db) -> Self {
        Self::with_retention(db, RetentionPolicy::default())
    }

    pub fn with_retention(db: &Db, retention: RetentionPolicy) -> Self {
        Self {
            pool: db.pool().clone(),
            retention,
            listener: Mutex::new(None),
        }
    }

    /// Drop terminal-state rows beyond the retention bound, oldest first.
    async fn prune(&self, state: State, keep: usize) -> Result<()> {
        sqlx::query(
            "DELETE FROM jobs
             WHERE state = $1 AND id NOT IN (
                 SELECT id FROM jobs WHERE state = $1
                 ORDER BY updated_at DESC LIMIT $2
             )",
        )
        .bind(state.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn record_op(&self, operation: &'static str) {
        metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn submit(&self, new: NewJob) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let row: JobRow = sqlx::query_as(&format!(
            "INSERT INTO jobs (id, kind, payload, priority, state, attempts_made, max_attempts, backoff_base_ms, run_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'waiting', 0, $5, $6, $7, $8, $8)
             RETURNING {JOB_COLUMNS}",
        ))
        .bind(id)
        .bind(new.kind.as_str())
        .bind(&new.payload)
        .bind(new.effective_priority())
        .bind(new.max_attempts as i32)
        .bind(new.backoff.base().as_millis() as i64)
        .bind(now + new.delay)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // NOTIFY is transactional — only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(new.kind.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("kind", new.kind.as_str()),
                KeyValue::new("result", "ok"),
            ],
        );

        row.try_into_job()
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET state = 'active', attempts_made = attempts_made + 1, updated_at = now()
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state = 'waiting' AND run_at <= now()
                 ORDER BY priority ASC, created_at ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}",
        ))
        .fetch_optional(&self.pool)
        .await?;

        self.record_op(if row.is_some() { "claim" } else { "claim_empty" });

        row.map(JobRow::try_into_job).transpose()
    }

    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET state = 'completed', result = $2, updated_at = now()
             WHERE id = $1 AND state = 'active'
             RETURNING {JOB_COLUMNS}",
        ))
        .bind(id.0)
        .bind(&result)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(Error::InvalidTransition {
            from: State::Active,
            to: State::Completed,
        })?;

        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "completed")],
        );

        self.prune(State::Completed, self.retention.completed).await?;
        row.try_into_job()
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Job> {
        // attempts_made was already incremented at claim time, so the
        // ceiling check and the backoff exponent both read it directly.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET state = CASE WHEN attempts_made >= max_attempts THEN 'failed' ELSE 'waiting' END,
                 run_at = CASE WHEN attempts_made >= max_attempts THEN run_at
                               ELSE now() + (backoff_base_ms * (1::bigint << LEAST(attempts_made - 1, 31))) * interval '1 millisecond'
                          END,
                 last_error = $2,
                 updated_at = now()
             WHERE id = $1 AND state = 'active'
             RETURNING {JOB_COLUMNS}",
        ))
        .bind(id.0)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(Error::InvalidTransition {
            from: State::Active,
            to: State::Failed,
        })?;

        let job = row.try_into_job()?;
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "active"),
                KeyValue::new("to", job.state.as_str()),
            ],
        );

        if job.state == State::Failed {
            self.prune(State::Failed, self.retention.failed).await?;
        }
        Ok(job)
    }

    async fn fail_permanently(&self, id: JobId, error: &str) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET state = 'failed', last_error = $2, updated_at = now()
             WHERE id = $1 AND state = 'active'
             RETURNING {JOB_COLUMNS}",
        ))
        .bind(id.0)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(Error::InvalidTransition {
            from: State::Active,
            to: State::Failed,
        })?;

        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "active"), KeyValue::new("to", "failed")],
        );

        self.prune(State::Failed, self.retention.failed).await?;
        row.try_into_job()
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    async fn list(&self, state: Option<State>, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(s) => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = $1
                     ORDER BY created_at DESC LIMIT $2",
                ))
                .bind(s.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1",
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.parse::<State>()? {
                State::Waiting => stats.waiting = count as u64,
                State::Active => stats.active = count as u64,
                State::Completed => stats.completed = count as u64,
                State::Failed => stats.failed = count as u64,
            }
        }

        self.record_op("stats");
        Ok(stats)
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64> {
        let reclaimed = sqlx::query(
            "UPDATE jobs
             SET state = 'waiting', run_at = now(), updated_at = now()
             WHERE state = 'active' AND updated_at < now() - ($1 * interval '1 second')",
        )
        .bind(older_than.as_secs() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reclaimed > 0 {
            warn!(reclaimed, "requeued stale active jobs");
            sqlx::query("SELECT pg_notify($1, 'reclaim')")
                .bind(NOTIFY_CHANNEL)
                .execute(&self.pool)
                .await?;
        }
        Ok(reclaimed)
    }

    async fn wait_for_jobs(&self, timeout: Duration) {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match PgListener::connect_with(&self.pool).await {
                Ok(mut listener) => match listener.listen(NOTIFY_CHANNEL).await {
                    Ok(()) => *guard = Some(listener),
                    Err(e) => warn!("LISTEN {NOTIFY_CHANNEL} failed: {e}, falling back to poll"),
                },
                Err(e) => warn!("PgListener connect failed: {e}, falling back to poll"),
            }
        }

        let outcome = match guard.as_mut() {
            Some(listener) => Some(tokio::time::timeout(timeout, listener.recv()).await),
            None => None,
        };
        match outcome {
            Some(Ok(Ok(_notification))) => {}
            Some(Ok(Err(e))) => {
                warn!("PgListener error: {e}, rebuilding on next wait");
                *guard = None;
            }
            Some(Err(_elapsed)) => {}
            None => tokio::time::sleep(timeout).await,
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    payload: serde_json::Value,
    priority: i32,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    backoff_base_ms: i64,
    run_at: chrono::DateTime<Utc>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            kind: self.kind,
            payload: self.payload,
            priority: self.priority,
            state: self.state.parse()?,
            attempts_made: self.attempts_made as u32,
            max_attempts: self.max_attempts as u32,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(self.backoff_base_ms.max(0) as u64),
            },
            run_at: self.run_at,
            last_error: self.last_error,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
