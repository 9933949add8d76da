//! Checkpoint store — persists the indexer's position for crash recovery.
//!
//! A checkpoint stores the last committed cursor of one indexer identity.
//! On restart, the stream resumes strictly after it rather than re-indexing
//! from scratch.
//!
//! All functions run on the caller's connection so they join the block's
//! transaction.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::debug;

use chainstate_core::cursor::Cursor;
use chainstate_core::error::StateError;

/// A persisted checkpoint for an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Indexer identity.
    pub indexer_id: String,
    /// Last committed cursor.
    pub cursor: Cursor,
}

fn cursor_from_row(row: &SqliteRow) -> Result<Cursor, sqlx::Error> {
    Ok(Cursor {
        order_key: row.try_get::<i64, _>("order_key")? as u64,
        unique_key: row.try_get("unique_key")?,
    })
}

/// Load the checkpoint of `indexer_id` (returns `None` if none exists).
pub async fn get_checkpoint(
    conn: &mut SqliteConnection,
    indexer_id: &str,
) -> Result<Option<Cursor>, StateError> {
    let row = sqlx::query("SELECT order_key, unique_key FROM chainstate_checkpoints WHERE id = ?")
        .bind(indexer_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("get_checkpoint", indexer_id, e))?;

    row.as_ref()
        .map(cursor_from_row)
        .transpose()
        .map_err(|e| StateError::persistence("get_checkpoint", indexer_id, e))
}

/// Save (upsert) the checkpoint.
///
/// `unique_key` is overwritten unconditionally, including with `NULL`, so a
/// cleared fingerprint is never confused with a stale one.
pub async fn set_checkpoint(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
) -> Result<(), StateError> {
    sqlx::query(
        "INSERT INTO chainstate_checkpoints (id, order_key, unique_key)
         VALUES (?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
            order_key  = excluded.order_key,
            unique_key = excluded.unique_key",
    )
    .bind(indexer_id)
    .bind(cursor.order_key_i64()?)
    .bind(cursor.unique_key.as_deref())
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("set_checkpoint", indexer_id, e))?;

    debug!(indexer_id, cursor = %cursor, "checkpoint saved");
    Ok(())
}

/// Move the checkpoint back to `cursor` if it is ahead of it.
///
/// Returns `true` if the checkpoint moved.
pub async fn rollback_checkpoint(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
) -> Result<bool, StateError> {
    let result = sqlx::query(
        "UPDATE chainstate_checkpoints
         SET order_key = ?, unique_key = ?
         WHERE id = ? AND order_key > ?",
    )
    .bind(cursor.order_key_i64()?)
    .bind(cursor.unique_key.as_deref())
    .bind(indexer_id)
    .bind(cursor.order_key_i64()?)
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("rollback_checkpoint", indexer_id, e))?;

    Ok(result.rows_affected() > 0)
}

/// Delete the checkpoint (re-indexing from scratch).
pub async fn reset_checkpoint(
    conn: &mut SqliteConnection,
    indexer_id: &str,
) -> Result<(), StateError> {
    sqlx::query("DELETE FROM chainstate_checkpoints WHERE id = ?")
        .bind(indexer_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("reset_checkpoint", indexer_id, e))?;
    Ok(())
}

/// Every stored checkpoint, ordered by identity.
pub async fn list_checkpoints(conn: &mut SqliteConnection) -> Result<Vec<Checkpoint>, StateError> {
    let rows = sqlx::query("SELECT id, order_key, unique_key FROM chainstate_checkpoints ORDER BY id")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("list_checkpoints", "*", e))?;

    rows.iter()
        .map(|r| {
            Ok(Checkpoint {
                indexer_id: r.try_get("id")?,
                cursor: cursor_from_row(r)?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| StateError::persistence("list_checkpoints", "*", e))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::initialize_state_schema;
    use crate::StateDb;

    async fn setup() -> StateDb {
        let db = StateDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        initialize_state_schema(&mut conn).await.unwrap();
        db
    }

    #[tokio::test]
    async fn checkpoint_missing_returns_none() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(get_checkpoint(&mut conn, "unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_upsert() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        set_checkpoint(&mut conn, "idx", &Cursor::with_unique_key(100, "0xold")).await.unwrap();
        set_checkpoint(&mut conn, "idx", &Cursor::with_unique_key(200, "0xnew")).await.unwrap();

        // Only one row; second save overwrites the first
        let loaded = get_checkpoint(&mut conn, "idx").await.unwrap().unwrap();
        assert_eq!(loaded, Cursor::with_unique_key(200, "0xnew"));
        assert_eq!(list_checkpoints(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unique_key_explicit_clear() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        set_checkpoint(&mut conn, "idx", &Cursor::with_unique_key(5, "0xabc")).await.unwrap();
        set_checkpoint(&mut conn, "idx", &Cursor::new(6)).await.unwrap();

        let loaded = get_checkpoint(&mut conn, "idx").await.unwrap().unwrap();
        assert_eq!(loaded.order_key, 6);
        assert_eq!(loaded.unique_key, None);
    }

    #[tokio::test]
    async fn unstorable_order_key_is_refused() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        set_checkpoint(&mut conn, "idx", &Cursor::new(10)).await.unwrap();

        let err = set_checkpoint(&mut conn, "idx", &Cursor::new(u64::MAX)).await.unwrap_err();
        assert!(matches!(err, StateError::Config(_)));
        // A wrapped key would have compared below 10 and moved the checkpoint.
        assert!(rollback_checkpoint(&mut conn, "idx", &Cursor::new(u64::MAX)).await.is_err());
        assert_eq!(get_checkpoint(&mut conn, "idx").await.unwrap().unwrap().order_key, 10);
    }

    #[tokio::test]
    async fn rollback_only_moves_backwards() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        set_checkpoint(&mut conn, "idx", &Cursor::with_unique_key(110, "0x110")).await.unwrap();

        assert!(!rollback_checkpoint(&mut conn, "idx", &Cursor::new(120)).await.unwrap());
        assert!(rollback_checkpoint(&mut conn, "idx", &Cursor::with_unique_key(105, "0x105")).await.unwrap());

        let loaded = get_checkpoint(&mut conn, "idx").await.unwrap().unwrap();
        assert_eq!(loaded, Cursor::with_unique_key(105, "0x105"));
    }

    #[tokio::test]
    async fn reset_and_identity_isolation() {
        let db = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        set_checkpoint(&mut conn, "a", &Cursor::new(1)).await.unwrap();
        set_checkpoint(&mut conn, "b", &Cursor::new(2)).await.unwrap();

        reset_checkpoint(&mut conn, "a").await.unwrap();
        assert!(get_checkpoint(&mut conn, "a").await.unwrap().is_none());
        assert_eq!(get_checkpoint(&mut conn, "b").await.unwrap().unwrap().order_key, 2);
    }
}
