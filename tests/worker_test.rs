//! Worker pool end-to-end behavior against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use drcal_jobs::event::QueueEvent;
use drcal_jobs::handler::{
    HandlerRegistry, NotificationSink, ProcessAppointmentHandler, SendNotificationHandler,
};
use drcal_jobs::model::{
    BackoffPolicy, Job, JobId, JobKind, NewJob, NotificationRequest, State,
};
use drcal_jobs::store::{LockService, QueueStore};
use drcal_jobs::store::memory::{MemoryLockService, MemoryQueueStore};
use drcal_jobs::worker::{WorkerConfig, WorkerPool};
use serde_json::json;

// ---------------------------------------------------------------------------
// Test doubles and helpers
// ---------------------------------------------------------------------------

/// Sink that fails the first `fail_first` deliveries, then succeeds.
struct FlakySink {
    fail_first: usize,
    calls: AtomicUsize,
}

impl FlakySink {
    fn new(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NotificationSink for FlakySink {
    async fn deliver(&self, _note: &NotificationRequest) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            anyhow::bail!("transport down (call {call})");
        }
        Ok(())
    }
}

/// Sink that takes a while, for shutdown-drain tests.
struct SlowSink {
    delay: Duration,
}

#[async_trait]
impl NotificationSink for SlowSink {
    async fn deliver(&self, _note: &NotificationRequest) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Sink that panics, for slot-poisoning tests.
struct PanickingSink;

#[async_trait]
impl NotificationSink for PanickingSink {
    async fn deliver(&self, _note: &NotificationRequest) -> anyhow::Result<()> {
        panic!("sink blew up");
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 5,
        poll_interval: Duration::from_millis(20),
        reclaim_after: Duration::from_secs(300),
        reclaim_interval: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(5),
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::Exponential {
        base: Duration::from_millis(30),
    }
}

fn notification_registry(sink: Arc<dyn NotificationSink>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(SendNotificationHandler::new(sink)));
    Arc::new(registry)
}

fn notification_payload() -> serde_json::Value {
    json!({"id": "n1", "type": "waitlist_added", "recipient": "pat@example.com"})
}

/// Poll the store until the job satisfies `pred` or the timeout hits.
async fn wait_for(
    store: &Arc<MemoryQueueStore>,
    id: JobId,
    timeout: Duration,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get(id).await.unwrap();
        if pred(&job) {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for job {id}: state={} attempts={}",
                job.state, job.attempts_made
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Retry behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notification_succeeds_on_third_attempt() {
    let store = Arc::new(MemoryQueueStore::new());
    let sink = Arc::new(FlakySink::new(2));
    let pool = WorkerPool::with_config(
        store.clone(),
        notification_registry(sink.clone()),
        fast_config(),
    );

    let job = store
        .submit(
            NewJob::new(JobKind::SendNotification, notification_payload())
                .backoff(fast_backoff()),
        )
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let done = wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;

    assert_eq!(done.state, State::Completed);
    assert_eq!(done.attempts_made, 3);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    let result = done.result.unwrap();
    assert_eq!(result["status"], "sent");
    assert_eq!(result["recipient"], "pat@example.com");

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_attempts_leave_the_job_failed() {
    let store = Arc::new(MemoryQueueStore::new());
    let sink = Arc::new(FlakySink::new(usize::MAX));
    let pool = WorkerPool::with_config(
        store.clone(),
        notification_registry(sink.clone()),
        fast_config(),
    );

    let job = store
        .submit(
            NewJob::new(JobKind::SendNotification, notification_payload())
                .backoff(fast_backoff()),
        )
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let dead = wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;

    assert_eq!(dead.state, State::Failed);
    assert_eq!(dead.attempts_made, 3);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert!(dead.last_error.unwrap().contains("delivery failed"));

    // Stays failed — nothing further is attempted.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Unroutable kinds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unroutable_kind_fails_without_retry() {
    let store = Arc::new(MemoryQueueStore::new());
    // Registry with only the appointment handler: notifications are
    // unroutable here.
    let locks = Arc::new(MemoryLockService::new());
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ProcessAppointmentHandler::new(locks)));
    let pool = WorkerPool::with_config(store.clone(), Arc::new(registry), fast_config());

    let job = store
        .submit(
            NewJob::new(JobKind::SendNotification, notification_payload())
                .backoff(fast_backoff()),
        )
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let dead = wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;

    assert_eq!(dead.state, State::Failed);
    // One claim, zero retries.
    assert_eq!(dead.attempts_made, 1);
    assert!(dead.last_error.unwrap().contains("unknown job kind"));

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Lock contention (appointment processing)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn contended_appointment_retries_after_lock_release() {
    let store = Arc::new(MemoryQueueStore::new());
    let locks = Arc::new(MemoryLockService::new());
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ProcessAppointmentHandler::new(locks.clone())));
    let pool = WorkerPool::with_config(store.clone(), Arc::new(registry), fast_config());

    // Someone else is processing appointment A1 right now.
    let external = locks.try_acquire("appointment_A1").await.unwrap().unwrap();

    let job = store
        .submit(
            NewJob::new(JobKind::ProcessAppointment, json!({"id": "A1"}))
                .backoff(fast_backoff())
                .max_attempts(5),
        )
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    // First attempt must lose the lock race and reschedule.
    let contended = wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.attempts_made >= 1 && j.state == State::Waiting
    })
    .await;
    assert!(
        contended
            .last_error
            .as_deref()
            .unwrap()
            .contains("already being processed")
    );

    // Holder finishes; the retry goes through.
    external.release().await.unwrap();

    let done = wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;
    assert_eq!(done.state, State::Completed);
    assert!(done.attempts_made >= 2);
    let result = done.result.unwrap();
    assert_eq!(result["entity_id"], "A1");
    assert_eq!(result["status"], "processed");
    assert!(!locks.is_held("appointment_A1"));

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

/// Known weak case: a payload without an id gets a timestamp-derived
/// lock key, which is unique per attempt and therefore excludes
/// nothing. Both jobs must simply complete.
#[tokio::test]
async fn missing_entity_id_processes_without_real_exclusion() {
    let store = Arc::new(MemoryQueueStore::new());
    let locks = Arc::new(MemoryLockService::new());
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ProcessAppointmentHandler::new(locks)));
    let pool = WorkerPool::with_config(store.clone(), Arc::new(registry), fast_config());

    let a = store
        .submit(NewJob::new(
            JobKind::ProcessAppointment,
            json!({"patient_name": "Ana"}),
        ))
        .await
        .unwrap();
    let b = store
        .submit(NewJob::new(
            JobKind::ProcessAppointment,
            json!({"patient_name": "Bruno"}),
        ))
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let done_a = wait_for(&store, a.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;
    let done_b = wait_for(&store, b.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;

    assert_eq!(done_a.state, State::Completed);
    assert_eq!(done_b.state, State::Completed);
    assert_eq!(done_a.result.as_ref().unwrap()["entity_id"], json!(null));

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_and_failed_events_are_emitted() {
    let store = Arc::new(MemoryQueueStore::new());
    let sink = Arc::new(FlakySink::new(0));
    let pool = WorkerPool::with_config(store.clone(), notification_registry(sink), fast_config());
    let mut events = pool.subscribe();

    store
        .submit(NewJob::new(JobKind::SendNotification, notification_payload()))
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event within timeout")
        .unwrap();
    match event {
        QueueEvent::Completed { job } => assert_eq!(job.state, State::Completed),
        other => panic!("expected Completed event, got {other:?}"),
    }

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Panic containment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_handler_counts_as_failed_attempts() {
    let store = Arc::new(MemoryQueueStore::new());
    let pool = WorkerPool::with_config(
        store.clone(),
        notification_registry(Arc::new(PanickingSink)),
        fast_config(),
    );

    let job = store
        .submit(
            NewJob::new(JobKind::SendNotification, notification_payload())
                .backoff(fast_backoff()),
        )
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    let dead = wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.state.is_terminal()
    })
    .await;

    assert_eq!(dead.state, State::Failed);
    assert_eq!(dead.attempts_made, 3);
    assert!(dead.last_error.unwrap().contains("panicked"));

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_waits_for_in_flight_handlers() {
    let store = Arc::new(MemoryQueueStore::new());
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(150),
    });
    let pool = WorkerPool::with_config(store.clone(), notification_registry(sink), fast_config());

    let job = store
        .submit(NewJob::new(JobKind::SendNotification, notification_payload()))
        .await
        .unwrap();

    let runner = tokio::spawn({
        let pool = pool.clone();
        async move { pool.run().await }
    });

    // Wait until the job is claimed, then shut down mid-flight.
    wait_for(&store, job.id, Duration::from_secs(5), |j| {
        j.state == State::Active || j.state.is_terminal()
    })
    .await;
    pool.shutdown();
    runner.await.unwrap().unwrap();

    // The in-flight handler finished before run() returned.
    let done = store.get(job.id).await.unwrap();
    assert_eq!(done.state, State::Completed);
}
