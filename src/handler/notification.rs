//! `send-notification`: delivery of a notification to a recipient.
//!
//! Delivery goes through the [`NotificationSink`] seam. No locking —
//! duplicate sends are tolerated; idempotency is the sink's
//! responsibility, not the queue's.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::model::{Job, JobKind, NotificationReceipt, NotificationRequest};

use super::{HandlerError, JobHandler};

/// Transport that actually delivers notifications (email, push, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, note: &NotificationRequest) -> anyhow::Result<()>;
}

/// Default sink: records the delivery in the log stream. Real transports
/// implement [`NotificationSink`] and are injected at wiring time.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, note: &NotificationRequest) -> anyhow::Result<()> {
        info!(
            notification_type = %note.notification_type,
            recipient = %note.recipient,
            "notification delivered"
        );
        Ok(())
    }
}

/// Delivers notifications described by the job payload.
pub struct SendNotificationHandler {
    sink: Arc<dyn NotificationSink>,
}

impl SendNotificationHandler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl JobHandler for SendNotificationHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendNotification
    }

    async fn run(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let note: NotificationRequest = serde_json::from_value(job.payload.clone())?;

        self.sink
            .deliver(&note)
            .await
            .map_err(|e| HandlerError::Execution(format!("delivery failed: {e}")))?;

        let receipt = NotificationReceipt {
            notification_id: note.id.clone(),
            notification_type: note.notification_type.clone(),
            recipient: note.recipient.clone(),
            status: "sent".to_string(),
            sent_at: Utc::now(),
        };

        Ok(serde_json::to_value(receipt)?)
    }
}
