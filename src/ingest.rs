//! Change-event ingestion: maps data-store change notifications onto
//! queue submissions.
//!
//! The producing side (webhook route or request handler) stays outside
//! this crate; it hands us a [`ChangeEvent`] and we decide which jobs
//! to enqueue. Queue unavailability is logged and swallowed here — a
//! change event must never fail the write that produced it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Job, JobKind};
use crate::queue::{QueueClient, SubmitOptions};

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A change notification from the data store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "type")]
    pub op: ChangeOp,
    /// Row after the change (insert/update).
    #[serde(default)]
    pub record: Option<Value>,
    /// Row before the change (update/delete).
    #[serde(default)]
    pub old_record: Option<Value>,
}

/// Translates change events into job submissions.
pub struct EventIngestor {
    queue: QueueClient,
}

impl EventIngestor {
    pub fn new(queue: QueueClient) -> Self {
        Self { queue }
    }

    /// Ingest one change event, returning the jobs it produced.
    ///
    /// Unrecognized table/op combinations are skipped. A queue outage
    /// drops the event with a warning rather than erroring out.
    pub async fn ingest(&self, event: ChangeEvent) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();

        match (event.table.as_str(), event.op) {
            ("appointments", ChangeOp::Insert) => {
                if let Some(record) = &event.record {
                    self.enqueue(&mut jobs, JobKind::ProcessAppointment, record.clone())
                        .await?;
                }
            }
            ("appointments", ChangeOp::Update) => {
                let (Some(record), Some(old)) = (&event.record, &event.old_record) else {
                    return Ok(jobs);
                };
                // Only a status change is notification-worthy.
                if record.get("status") != old.get("status") {
                    let payload = json!({
                        "id": record.get("id"),
                        "type": "appointment_status_changed",
                        "recipient": record.get("patient_email"),
                        "appointment": record,
                        "old_status": old.get("status"),
                        "new_status": record.get("status"),
                    });
                    self.enqueue(&mut jobs, JobKind::SendNotification, payload)
                        .await?;
                }
            }
            ("appointments", ChangeOp::Delete) => {
                if let Some(old) = &event.old_record {
                    let payload = json!({
                        "id": old.get("id"),
                        "type": "appointment_cancelled",
                        "recipient": old.get("patient_email"),
                        "appointment": old,
                    });
                    self.enqueue(&mut jobs, JobKind::SendNotification, payload)
                        .await?;
                }
            }
            ("waitlist", ChangeOp::Insert) => {
                if let Some(record) = &event.record {
                    let payload = json!({
                        "id": record.get("id"),
                        "type": "waitlist_added",
                        "recipient": record.get("patient_email"),
                        "waitlist": record,
                    });
                    self.enqueue(&mut jobs, JobKind::SendNotification, payload)
                        .await?;
                }
            }
            ("auth.users", ChangeOp::Insert) => {
                if let Some(record) = &event.record {
                    let payload = json!({
                        "id": record.get("id"),
                        "type": "user_created",
                        "recipient": record.get("email"),
                        "user": record,
                    });
                    self.enqueue(&mut jobs, JobKind::SendNotification, payload)
                        .await?;
                }
            }
            (table, op) => {
                debug!(table, ?op, "unhandled change event");
            }
        }

        Ok(jobs)
    }

    /// Submit one job, degrading gracefully when the queue is down.
    async fn enqueue(&self, jobs: &mut Vec<Job>, kind: JobKind, payload: Value) -> Result<()> {
        match self.queue.submit(kind, payload, SubmitOptions::default()).await {
            Ok(job) => {
                jobs.push(job);
                Ok(())
            }
            Err(Error::QueueUnavailable(reason)) => {
                warn!(%kind, %reason, "queue unavailable, change event dropped");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}
