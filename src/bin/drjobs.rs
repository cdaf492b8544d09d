//! drjobs CLI — operator interface to the DrCal background job system.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use drcal_jobs::config::Config;
use drcal_jobs::db::Db;
use drcal_jobs::db::lock::PgLockService;
use drcal_jobs::db::queue::PgQueueStore;
use drcal_jobs::handler::{HandlerRegistry, TracingSink};
use drcal_jobs::ingest::{ChangeEvent, EventIngestor};
use drcal_jobs::model::{JobId, JobKind, State};
use drcal_jobs::queue::{QueueClient, SubmitOptions};
use drcal_jobs::telemetry::{TelemetryConfig, init_telemetry};
use drcal_jobs::worker::{WorkerConfig, WorkerPool};
use secrecy::ExposeSecret;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "drjobs", about = "DrCal background job queue and workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool daemon
    Serve {
        /// Concurrent execution slots (overrides WORKER_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Seconds between reconnect attempts when the store is down
        #[arg(long, default_value_t = 30)]
        reconnect_secs: u64,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Feed a change event (JSON) through the ingestion adapter
    Ingest {
        /// Change event JSON: {"table": ..., "type": ..., "record": ...}
        json: String,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// Job kind (process-appointment | send-notification)
        kind: String,
        /// JSON payload
        payload: String,
        /// Priority override (lower runs first)
        #[arg(long)]
        priority: Option<i32>,
        /// Delay in milliseconds before the job becomes eligible
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// List jobs
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Queue depth by state
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            concurrency,
            reconnect_secs,
        } => cmd_serve(concurrency, Duration::from_secs(reconnect_secs)).await,
        Command::Job { action } => {
            let queue = connect_queue().await?;
            match action {
                JobAction::Submit {
                    kind,
                    payload,
                    priority,
                    delay_ms,
                } => cmd_job_submit(&queue, kind, payload, priority, delay_ms).await,
                JobAction::List { state, limit } => cmd_job_list(&queue, state, limit).await,
                JobAction::Show { id } => cmd_job_show(&queue, id).await,
                JobAction::Stats => cmd_job_stats(&queue).await,
            }
        }
        Command::Ingest { json } => {
            let queue = connect_queue().await?;
            let event: ChangeEvent = serde_json::from_str(&json)?;
            let jobs = EventIngestor::new(queue).ingest(event).await?;
            for job in &jobs {
                println!("Enqueued: {} ({})", job.id, job.kind);
            }
            if jobs.is_empty() {
                println!("No jobs produced.");
            }
            Ok(())
        }
    }
}

async fn connect_queue() -> anyhow::Result<QueueClient> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret(), config.connect_timeout).await?;
    db.migrate().await?;
    Ok(QueueClient::new(Arc::new(PgQueueStore::new(&db))))
}

async fn cmd_serve(concurrency: Option<usize>, reconnect_interval: Duration) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "drcal-jobs".to_string(),
    })?;

    let concurrency = concurrency.unwrap_or(config.worker_concurrency);

    // The store being down disables background processing but never
    // kills the process; keep retrying so workers come back when the
    // database does.
    loop {
        let db =
            match Db::connect(config.database_url.expose_secret(), config.connect_timeout).await {
                Ok(db) => db,
                Err(e) => {
                    warn!(
                        "queue store unavailable ({e}), background processing disabled; \
                         retrying in {}s",
                        reconnect_interval.as_secs()
                    );
                    tokio::time::sleep(reconnect_interval).await;
                    continue;
                }
            };
        db.migrate().await?;

        let store = Arc::new(PgQueueStore::new(&db));
        let locks = Arc::new(PgLockService::new(&db));
        let registry = Arc::new(HandlerRegistry::builtin(locks, Arc::new(TracingSink)));

        let pool = WorkerPool::with_config(
            store,
            registry,
            WorkerConfig {
                concurrency,
                ..WorkerConfig::default()
            },
        );

        let ctrl = pool.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            ctrl.shutdown();
        });

        match pool.run().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                error!("worker pool exited with error: {e}, restarting");
                tokio::time::sleep(reconnect_interval).await;
            }
        }
    }
}

async fn cmd_job_submit(
    queue: &QueueClient,
    kind: String,
    payload: String,
    priority: Option<i32>,
    delay_ms: u64,
) -> anyhow::Result<()> {
    let kind: JobKind = kind.parse()?;
    let payload: serde_json::Value = serde_json::from_str(&payload)?;

    let job = queue
        .submit(
            kind,
            payload,
            SubmitOptions {
                priority,
                delay: (delay_ms > 0).then(|| Duration::from_millis(delay_ms)),
            },
        )
        .await?;

    println!("Enqueued: {} (state: {}, priority: {})", job.id, job.state, job.priority);
    Ok(())
}

async fn cmd_job_list(
    queue: &QueueClient,
    state: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let state_filter: Option<State> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let jobs = queue.list(state_filter, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    // Header
    println!(
        "{:<8}  {:<20}  {:<10}  {:<4}  {:<8}  CREATED",
        "ID", "KIND", "STATE", "PRI", "ATTEMPTS"
    );
    println!("{}", "-".repeat(80));

    for job in &jobs {
        println!(
            "{:<8}  {:<20}  {:<10}  {:<4}  {:<8}  {}",
            job.id.to_string(),
            job.kind,
            job.state,
            job.priority,
            format!("{}/{}", job.attempts_made, job.max_attempts),
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_show(queue: &QueueClient, id_str: String) -> anyhow::Result<()> {
    // Support prefix matching — find the job whose ID starts with the given string
    let id = if id_str.len() < 36 {
        let jobs = queue.list(None, 100).await?;
        let matches: Vec<_> = jobs
            .iter()
            .filter(|job| job.id.0.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no job matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} jobs match prefix '{id_str}' — be more specific"),
        }
    } else {
        JobId(uuid::Uuid::parse_str(&id_str)?)
    };

    let job = queue.get(id).await?;

    println!("ID:         {}", job.id);
    println!("Kind:       {}", job.kind);
    println!("State:      {}", job.state);
    println!("Priority:   {}", job.priority);
    println!("Attempts:   {}/{}", job.attempts_made, job.max_attempts);
    println!("Backoff:    {}ms base", job.backoff.base().as_millis());
    println!("Run At:     {}", job.run_at);
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(ref err) = job.last_error {
        println!("Last Error: {err}");
    }
    if let Some(ref result) = job.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }

    Ok(())
}

async fn cmd_job_stats(queue: &QueueClient) -> anyhow::Result<()> {
    let stats = queue.stats().await?;
    println!("waiting:    {}", stats.waiting);
    println!("active:     {}", stats.active);
    println!("completed:  {}", stats.completed);
    println!("failed:     {}", stats.failed);
    Ok(())
}
