//! Advisory lock service over Postgres.
//!
//! Uses `pg_try_advisory_xact_lock` on a hashed text key inside a
//! dedicated transaction: acquisition is a single atomic operation, and
//! the lock cannot outlive the transaction. Commit, rollback, or
//! connection death all release it, so a crashed holder never wedges
//! the key.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::{PgPool, Postgres, Transaction};

use crate::db::Db;
use crate::error::Result;
use crate::store::{LockGuard, LockService};
use crate::telemetry::metrics;

/// Postgres implementation of [`LockService`].
pub struct PgLockService {
    pool: PgPool,
}

impl PgLockService {
    pub fn new(db: &Db) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_acquire(&self, key: &str) -> Result<Option<Box<dyn LockGuard>>> {
        let mut tx = self.pool.begin().await?;

        let (locked,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        metrics::lock_attempts().add(
            1,
            &[KeyValue::new(
                "result",
                if locked { "acquired" } else { "contended" },
            )],
        );

        if !locked {
            tx.rollback().await?;
            return Ok(None);
        }

        Ok(Some(Box::new(PgLockGuard { tx: Some(tx) })))
    }
}

/// Holds the transaction that owns the advisory lock. Dropping the
/// guard rolls the transaction back, which releases the lock.
struct PgLockGuard {
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl LockGuard for PgLockGuard {
    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
