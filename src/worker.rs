//! Worker pool: claims eligible jobs and drives them through their
//! handlers.
//!
//! A fixed number of slots execute concurrently; the store's atomic
//! claim is the only cross-slot (and cross-process) coordination.
//! The pool is an explicit value — construct it once at startup with
//! its store and registry, no module-level state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{Notify, broadcast};
use tracing::{Instrument, error, info, warn};

use crate::error::Result;
use crate::event::QueueEvent;
use crate::handler::HandlerRegistry;
use crate::model::Job;
use crate::store::QueueStore;
use crate::telemetry::job::{record_outcome, start_job_span};
use crate::telemetry::metrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent execution slots.
    pub concurrency: usize,
    /// Poll interval fallback when no store notification arrives.
    pub poll_interval: Duration,
    /// Jobs `active` longer than this are assumed orphaned by a crashed
    /// worker and returned to `waiting`.
    pub reclaim_after: Duration,
    /// How often to run the reclaim sweep.
    pub reclaim_interval: Duration,
    /// How long shutdown waits for in-flight handlers before giving up.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(5),
            reclaim_after: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// The worker pool loop: wait for work, claim, dispatch, retire.
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    /// Wakes the claim loop when a slot frees up.
    slot_freed: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    events: broadcast::Sender<QueueEvent>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            slot_freed: Arc::clone(&self.slot_freed),
            in_flight: Arc::clone(&self.in_flight),
            events: self.events.clone(),
        }
    }
}

impl WorkerPool {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_config(store, registry, WorkerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
            slot_freed: Arc::new(Notify::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    /// Subscribe to queue events. Slow consumers lag and drop events;
    /// the pool never blocks on them.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Signal the pool to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the pool until shutdown, then drain in-flight handlers
    /// within the grace period.
    pub async fn run(&self) -> Result<()> {
        info!(
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        let mut last_reclaim = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker pool shutting down");
                    break;
                }
                _ = self.slot_freed.notified() => {}
                _ = self.store.wait_for_jobs(self.config.poll_interval) => {}
            }

            if last_reclaim.elapsed() >= self.config.reclaim_interval {
                last_reclaim = tokio::time::Instant::now();
                if let Err(e) = self.store.reclaim_stale(self.config.reclaim_after).await {
                    self.emit_pool_error(format!("reclaim failed: {e}"));
                }
            }

            if let Err(e) = self.claim_available().await {
                // Store connectivity loss: in-flight jobs stay active in
                // the store and come back via the reclaim sweep. Keep the
                // loop alive and retry after a beat.
                self.emit_pool_error(format!("claim failed: {e}"));
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        self.drain_in_flight().await;
        Ok(())
    }

    /// Claim and dispatch eligible jobs until slots or work run out.
    async fn claim_available(&self) -> Result<()> {
        while self.in_flight.load(Ordering::Relaxed) < self.config.concurrency {
            let Some(job) = self.store.claim_next().await? else {
                return Ok(());
            };

            self.in_flight.fetch_add(1, Ordering::Relaxed);
            let pool = self.clone();
            tokio::spawn(async move {
                pool.execute(job).await;
                pool.in_flight.fetch_sub(1, Ordering::Relaxed);
                pool.slot_freed.notify_one();
            });
        }
        Ok(())
    }

    /// Run one claimed job to retirement.
    async fn execute(&self, job: Job) {
        let span = start_job_span(&job.kind, &job.id, job.attempts_made);

        async {
            // Unroutable kinds can never succeed — fail without retry.
            let handler = match job.parsed_kind().and_then(|k| self.registry.get(k).cloned()) {
                Some(h) => h,
                None => {
                    warn!(kind = %job.kind, "no handler for job kind, failing permanently");
                    match self
                        .store
                        .fail_permanently(job.id, &format!("unknown job kind: {}", job.kind))
                        .await
                    {
                        Ok(dead) => {
                            record_outcome("failed");
                            self.emit(QueueEvent::Failed {
                                job: dead,
                                error: format!("unknown job kind: {}", job.kind),
                            });
                        }
                        Err(e) => self.emit_pool_error(format!("retire failed: {e}")),
                    }
                    return;
                }
            };

            let started = std::time::Instant::now();

            // Run the handler on its own task so a panic surfaces as a
            // JoinError and counts as a failed attempt instead of
            // poisoning the slot.
            let run = tokio::spawn({
                let handler = Arc::clone(&handler);
                let job = job.clone();
                async move { handler.run(&job).await }.instrument(tracing::Span::current())
            });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(crate::handler::HandlerError::Execution(format!(
                    "handler panicked: {join_err}"
                ))),
            };

            metrics::handler_duration_ms().record(
                started.elapsed().as_millis() as f64,
                &[KeyValue::new("kind", job.kind.clone())],
            );

            match outcome {
                Ok(result) => match self.store.complete(job.id, result).await {
                    Ok(done) => {
                        info!(id = %done.id, attempts = done.attempts_made, "job completed");
                        record_outcome("completed");
                        self.emit(QueueEvent::Completed { job: done });
                    }
                    Err(e) => self.emit_pool_error(format!("retire failed: {e}")),
                },
                Err(handler_err) => {
                    let error = handler_err.to_string();
                    match self.store.fail(job.id, &error).await {
                        Ok(failed) => {
                            if failed.state.is_terminal() {
                                error!(id = %failed.id, %error, "job permanently failed");
                            } else {
                                warn!(
                                    id = %failed.id,
                                    %error,
                                    retry_at = %failed.run_at,
                                    "job failed, retry scheduled"
                                );
                            }
                            record_outcome(failed.state.as_str());
                            self.emit(QueueEvent::Failed { job: failed, error });
                        }
                        Err(e) => self.emit_pool_error(format!("retire failed: {e}")),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Wait for in-flight handlers to finish, up to the grace period.
    async fn drain_in_flight(&self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let in_flight = self.in_flight.load(Ordering::Relaxed);
            if in_flight == 0 {
                info!("worker pool stopped");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "shutdown grace elapsed, abandoning in-flight jobs");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn emit_pool_error(&self, message: String) {
        error!("{message}");
        self.emit(QueueEvent::Error {
            message,
            at: Utc::now(),
        });
    }
}
