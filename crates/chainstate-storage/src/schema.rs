//! Versioned schema for the engine's own state tables.
//!
//! The stored version lives in a singleton row. Startup takes the database
//! write lock through that row, refuses to run against a newer schema, and
//! applies the missing forward migrations in order.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, info};

use chainstate_core::error::StateError;

/// Highest schema version this build understands.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// `MIGRATIONS[i]` upgrades the schema from version `i` to `i + 1`.
const MIGRATIONS: [&[&str]; CURRENT_SCHEMA_VERSION as usize] = [
    // 0 → 1: resume position and filter history
    &[
        "CREATE TABLE IF NOT EXISTS chainstate_checkpoints (
            id         TEXT    NOT NULL PRIMARY KEY,
            order_key  INTEGER NOT NULL,
            unique_key TEXT
        )",
        "CREATE TABLE IF NOT EXISTS chainstate_filters (
            id         TEXT    NOT NULL,
            filter     TEXT    NOT NULL,
            from_block INTEGER NOT NULL,
            to_block   INTEGER,
            PRIMARY KEY (id, from_block)
        )",
    ],
    // 1 → 2: chain reorganization audit log
    &[
        "CREATE TABLE IF NOT EXISTS chainstate_chain_reorganizations (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            indexer_id          TEXT    NOT NULL,
            old_head_order_key  INTEGER NOT NULL,
            old_head_unique_key TEXT,
            new_head_order_key  INTEGER NOT NULL,
            new_head_unique_key TEXT,
            recorded_at         INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_chainstate_reorgs_indexer
         ON chainstate_chain_reorganizations (indexer_id, id)",
    ],
];

/// Bring the state schema up to [`CURRENT_SCHEMA_VERSION`].
///
/// Must run inside the startup transaction; returns the resulting version.
pub async fn initialize_state_schema(conn: &mut SqliteConnection) -> Result<i64, StateError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chainstate_schema_version (
            k       INTEGER PRIMARY KEY CHECK (k = 0),
            version INTEGER NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::Storage(format!("create schema_version: {e}")))?;

    // A write on the singleton row holds SQLite's write lock until the
    // transaction ends, so concurrent initializers run one after another.
    sqlx::query(
        "INSERT INTO chainstate_schema_version (k, version) VALUES (0, 0)
         ON CONFLICT (k) DO UPDATE SET version = version",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::Storage(format!("lock schema_version: {e}")))?;

    let stored = stored_version(conn).await?.unwrap_or(0);
    if stored > CURRENT_SCHEMA_VERSION {
        return Err(StateError::SchemaTooNew {
            stored,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for version in stored..CURRENT_SCHEMA_VERSION {
        for stmt in MIGRATIONS[version as usize] {
            sqlx::query(stmt).execute(&mut *conn).await.map_err(|e| {
                StateError::Storage(format!("migration {version}→{} failed: {e}", version + 1))
            })?;
        }
        info!(from = version, to = version + 1, "state schema migrated");
    }

    sqlx::query("UPDATE chainstate_schema_version SET version = ? WHERE k = 0")
        .bind(CURRENT_SCHEMA_VERSION)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::Storage(format!("store schema version: {e}")))?;

    debug!(version = CURRENT_SCHEMA_VERSION, "state schema ready");
    Ok(CURRENT_SCHEMA_VERSION)
}

/// The stored schema version, or `None` before the first initialization.
pub async fn stored_version(conn: &mut SqliteConnection) -> Result<Option<i64>, StateError> {
    let exists = sqlx::query(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'chainstate_schema_version'",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StateError::Storage(e.to_string()))?;
    if exists.is_none() {
        return Ok(None);
    }

    let row = sqlx::query("SELECT version FROM chainstate_schema_version WHERE k = 0")
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StateError::Storage(e.to_string()))?;

    row.map(|r| r.try_get::<i64, _>("version"))
        .transpose()
        .map_err(|e| StateError::Storage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateDb;

    #[tokio::test]
    async fn fresh_database_migrates_to_current() {
        let db = StateDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        assert_eq!(stored_version(&mut conn).await.unwrap(), None);
        let v = initialize_state_schema(&mut conn).await.unwrap();
        assert_eq!(v, CURRENT_SCHEMA_VERSION);
        assert_eq!(stored_version(&mut conn).await.unwrap(), Some(CURRENT_SCHEMA_VERSION));

        // Tables from every migration exist
        for table in ["chainstate_checkpoints", "chainstate_filters", "chainstate_chain_reorganizations"] {
            assert!(!crate::sql::table_columns(&mut conn, table).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let db = StateDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        initialize_state_schema(&mut conn).await.unwrap();
        initialize_state_schema(&mut conn).await.unwrap();
        assert_eq!(stored_version(&mut conn).await.unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn upgrades_from_older_version() {
        let db = StateDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        initialize_state_schema(&mut conn).await.unwrap();

        // Pretend a version-1 database: reorg table missing, version 1.
        sqlx::query("DROP TABLE chainstate_chain_reorganizations")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("UPDATE chainstate_schema_version SET version = 1")
            .execute(&mut *conn)
            .await
            .unwrap();

        initialize_state_schema(&mut conn).await.unwrap();
        assert!(!crate::sql::table_columns(&mut conn, "chainstate_chain_reorganizations")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn refuses_newer_schema() {
        let db = StateDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        initialize_state_schema(&mut conn).await.unwrap();
        sqlx::query("UPDATE chainstate_schema_version SET version = ?")
            .bind(CURRENT_SCHEMA_VERSION + 1)
            .execute(&mut *conn)
            .await
            .unwrap();

        let err = initialize_state_schema(&mut conn).await.unwrap_err();
        assert!(matches!(err, StateError::SchemaTooNew { stored, .. } if stored == CURRENT_SCHEMA_VERSION + 1));
    }
}
