//! Handler registry and the built-in job handlers.
//!
//! A handler is the function bound to a job kind. The registry is keyed
//! by [`JobKind`], so the worker loop stays untouched when kinds are
//! added: define the variant, implement [`JobHandler`], register it.

pub mod appointment;
pub mod notification;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Job, JobKind};
use crate::store::LockService;

pub use appointment::ProcessAppointmentHandler;
pub use notification::{NotificationSink, SendNotificationHandler, TracingSink};

/// Why a handler attempt failed. Both variants are retryable; failures
/// that can never succeed (unroutable kind) are decided by the pool
/// before a handler runs.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Advisory lock not acquired — another slot holds the entity.
    /// Contention is expected to clear, so the attempt is retried like
    /// any other failure.
    #[error("entity is already being processed")]
    AlreadyProcessing,

    /// Any other failure raised inside the handler.
    #[error("{0}")]
    Execution(String),
}

impl From<crate::error::Error> for HandlerError {
    fn from(e: crate::error::Error) -> Self {
        HandlerError::Execution(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Execution(format!("bad payload: {e}"))
    }
}

/// The processing function bound to a job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> JobKind;

    /// Execute one attempt. The returned value is stored as the job's
    /// result on completion.
    async fn run(&self, job: &Job) -> Result<serde_json::Value, HandlerError>;
}

/// Registry of handlers, indexed by job kind.
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the two standard handlers wired up.
    pub fn builtin(locks: Arc<dyn LockService>, sink: Arc<dyn NotificationSink>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ProcessAppointmentHandler::new(locks)));
        registry.register(Arc::new(SendNotificationHandler::new(sink)));
        registry
    }

    /// Register a handler under its kind, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
