//! Database connection pool, migrations, and health check.
//!
//! Shared Postgres connection pool backing both the queue store and the
//! advisory lock service.

pub mod lock;
pub mod queue;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres with a bounded start-up timeout.
    ///
    /// On timeout or connection failure the caller gets
    /// [`Error::QueueUnavailable`] and can choose to run without
    /// background processing instead of dying.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let connect = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(timeout)
            .connect(url);

        let pool = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                Error::QueueUnavailable(format!(
                    "connect timed out after {}s",
                    timeout.as_secs()
                ))
            })??;

        Ok(Self { pool })
    }

    /// Build a pool without connecting yet. Connections are established
    /// on first use; an unreachable store then surfaces per-call as
    /// [`Error::QueueUnavailable`] instead of blocking start-up. Meant
    /// for request-path wiring where the queue must not gate boot.
    pub fn connect_lazy(url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
