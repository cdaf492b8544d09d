//! Error types for drcal-jobs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The queue's backing store is unreachable. Non-fatal to the
    /// caller's primary workflow — submit sites log and continue.
    #[error("queue store unavailable: {0}")]
    QueueUnavailable(String),

    /// A job's kind has no registered handler. Never succeeds on retry.
    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for Error {
    /// Connection-class failures mean the store is unreachable, which
    /// callers of submit treat differently from a query bug.
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => Error::QueueUnavailable(e.to_string()),
            other => Error::Database(other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
