//! Core data model.
//!
//! A job is a unit of deferred background work. It has identity, a kind
//! that selects its handler, an opaque payload, scheduling attributes
//! (priority, eligibility time), and a retry budget.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of background work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at enqueue time.
    pub id: JobId,

    /// What kind of job this is. Stored as the raw tag so that rows
    /// written by other (possibly newer) producers survive a round-trip;
    /// parsed into [`JobKind`] at dispatch time.
    pub kind: String,

    /// Arbitrary payload for the handler. The queue doesn't interpret it.
    pub payload: serde_json::Value,

    /// Priority. Lower runs first among simultaneously eligible jobs.
    pub priority: i32,

    /// Current lifecycle state.
    pub state: State,

    /// Number of execution attempts so far.
    pub attempts_made: u32,

    /// Ceiling on attempts before the job fails permanently.
    pub max_attempts: u32,

    /// Delay growth between retry attempts.
    pub backoff: BackoffPolicy,

    /// When the job becomes eligible to run. Enqueue delay initially,
    /// pushed forward by the backoff policy on each retry.
    pub run_at: DateTime<Utc>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Handler result, stored on completion.
    pub result: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Parse the stored kind tag. `None` means no registered kind matches
    /// and the job can never succeed.
    pub fn parsed_kind(&self) -> Option<JobKind> {
        self.kind.parse().ok()
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The closed set of job kinds the built-in handlers cover.
///
/// The registry is keyed by kind, so adding a kind means adding a variant
/// and registering its handler — the worker loop itself never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Post-write processing of a newly created appointment.
    ProcessAppointment,
    /// Delivery of a notification to a recipient.
    SendNotification,
}

impl JobKind {
    /// String tag used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessAppointment => "process-appointment",
            JobKind::SendNotification => "send-notification",
        }
    }

    /// Default priority when the submitter doesn't pick one.
    /// Appointment processing outranks notifications.
    pub fn default_priority(&self) -> i32 {
        match self {
            JobKind::ProcessAppointment => 1,
            JobKind::SendNotification => 2,
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process-appointment" => Ok(JobKind::ProcessAppointment),
            "send-notification" => Ok(JobKind::SendNotification),
            _ => Err(crate::error::Error::UnknownJobKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Enqueued, waiting for a worker slot (or for its run_at to pass).
    Waiting,
    /// Claimed by exactly one worker slot, handler executing.
    Active,
    /// Handler succeeded. Terminal.
    Completed,
    /// Attempts exhausted or the kind is unroutable. Terminal.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Waiting) // retry after backoff
                | (Active, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Waiting => "waiting",
            State::Active => "active",
            State::Completed => "completed",
            State::Failed => "failed",
        }
    }
}

impl std::str::FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(State::Waiting),
            "active" => Ok(State::Active),
            "completed" => Ok(State::Completed),
            "failed" => Ok(State::Failed),
            _ => Err(crate::error::Error::Other(format!("invalid job state: {s}"))),
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackoffPolicy {
    /// `base * 2^(attempts_made - 1)`: base before attempt 2, doubled
    /// before each attempt after that.
    Exponential {
        #[serde(with = "duration_ms")]
        base: Duration,
    },
}

/// Base delay for the default exponential policy.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(2000);

/// Default ceiling on execution attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have run.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential { base } => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                *base * 2u32.pow(exponent)
            }
        }
    }

    pub fn base(&self) -> Duration {
        match self {
            BackoffPolicy::Exponential { base } => *base,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing new jobs. The queue's public submission input.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) kind: JobKind,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: Option<i32>,
    pub(crate) delay: Duration,
    pub(crate) max_attempts: u32,
    pub(crate) backoff: BackoffPolicy,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            priority: None,
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Override the kind-default priority. Lower runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Delay before the job becomes eligible to run.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Effective priority: explicit override or the kind default.
    pub(crate) fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or_else(|| self.kind.default_priority())
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Queue depth by state, for operational dashboards.
///
/// Computed from a snapshot query; the four counts are not point-in-time
/// consistent while jobs transition mid-read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// How much terminal-state history to keep. Storage hygiene, not a
/// correctness invariant.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Completed jobs retained (newest first).
    pub completed: usize,
    /// Failed jobs retained (newest first).
    pub failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: 10,
            failed: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Appointment snapshot carried by `process-appointment` jobs.
///
/// Every field is optional: the queue accepts whatever the producing
/// webhook or request handler captured, and the handler works with what
/// is there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentSnapshot {
    pub id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_email: Option<String>,
    pub appointment_date: Option<String>,
    pub doctor_id: Option<String>,
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result record produced by `process-appointment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub entity_id: Option<String>,
    pub status: String,
    pub processed_at: DateTime<Utc>,
    pub lock_key: String,
}

/// Notification carried by `send-notification` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub recipient: String,
    #[serde(flatten)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Receipt produced by `send-notification` on successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub notification_id: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub recipient: String,
    pub status: String,
    pub sent_at: DateTime<Utc>,
}
