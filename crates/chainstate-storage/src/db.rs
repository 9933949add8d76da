//! SQLite connection pool for chainstate.
//!
//! # Usage
//! ```rust,no_run
//! use chainstate_storage::StateDb;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let db = StateDb::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let db = StateDb::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use chainstate_core::error::StateError;

/// Handle to the database holding both consumer tables and engine state.
///
/// Cheaply cloneable — wraps a connection pool internally.
#[derive(Clone)]
pub struct StateDb {
    pool: SqlitePool,
}

impl StateDb {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StateError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| StateError::Storage(format!("open {path}: {e}")))?;

        // WAL mode — readers (CLI, dashboards) do not block the indexer
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(|e| StateError::Storage(e.to_string()))?;

        debug!(path, "state database opened");
        Ok(Self { pool })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StateError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StateError::Storage(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (shared with the consumer's own code).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begin a transaction; the unit of atomicity for every block and signal.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StateError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StateError::Storage(format!("begin transaction: {e}")))
    }

    /// Get the underlying connection pool (for custom queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Commit `tx`, mapping the failure into a storage error.
pub async fn commit(tx: Transaction<'static, Sqlite>) -> Result<(), StateError> {
    tx.commit()
        .await
        .map_err(|e| StateError::Storage(format!("commit: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pool_keeps_one_database() {
        let db = StateDb::in_memory().await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute(db.pool())
            .await
            .unwrap();

        // A second acquisition must see the same schema.
        let mut tx = db.begin().await.unwrap();
        sqlx::query("INSERT INTO t (id) VALUES (1)")
            .execute(&mut *tx)
            .await
            .unwrap();
        commit(tx).await.unwrap();

        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
