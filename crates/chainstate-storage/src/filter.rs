//! Filter version store — time-ranged history of subscription filters.
//!
//! In factory mode the subscription filter grows from data seen in the
//! stream. Each derived filter becomes a version `[from_block, to_block)`;
//! the active version has `to_block = NULL`. Versions are rolled back with
//! the data on invalidation, exactly like journaled rows.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::debug;

use chainstate_core::cursor::Cursor;
use chainstate_core::error::StateError;

/// One stored filter version.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterVersion<F> {
    pub filter: F,
    pub from_block: u64,
    /// `None` while this version is active.
    pub to_block: Option<u64>,
}

/// The active filter of `indexer_id`, if any.
pub async fn get_active_filter<F: DeserializeOwned>(
    conn: &mut SqliteConnection,
    indexer_id: &str,
) -> Result<Option<F>, StateError> {
    let row = sqlx::query("SELECT filter FROM chainstate_filters WHERE id = ? AND to_block IS NULL")
        .bind(indexer_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("get_active_filter", indexer_id, e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let text: String = row
        .try_get("filter")
        .map_err(|e| StateError::persistence("get_active_filter", indexer_id, e))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StateError::persistence("get_active_filter", indexer_id, format!("decode filter: {e}")))
}

/// Close the active version at `cursor` and start a new one there.
///
/// A version already starting at `cursor.order_key` is replaced, so
/// re-deriving the same boundary after a restart does not duplicate rows.
pub async fn append_or_extend_filter<F: Serialize>(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
    filter: &F,
) -> Result<(), StateError> {
    let text = serde_json::to_string(filter)
        .map_err(|e| StateError::persistence("append_filter", indexer_id, format!("encode filter: {e}")))?;

    sqlx::query("UPDATE chainstate_filters SET to_block = ? WHERE id = ? AND to_block IS NULL")
        .bind(cursor.order_key_i64()?)
        .bind(indexer_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("append_filter", indexer_id, e))?;

    sqlx::query(
        "INSERT INTO chainstate_filters (id, filter, from_block, to_block)
         VALUES (?, ?, ?, NULL)
         ON CONFLICT (id, from_block) DO UPDATE SET
            filter   = excluded.filter,
            to_block = NULL",
    )
    .bind(indexer_id)
    .bind(&text)
    .bind(cursor.order_key_i64()?)
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("append_filter", indexer_id, e))?;

    debug!(indexer_id, from_block = cursor.order_key, "filter version started");
    Ok(())
}

/// Undo filter transitions after `cursor`.
///
/// Versions that started after the cursor are deleted; the version closed
/// after it is reopened. Returns `(deleted, reopened)`.
pub async fn rollback_filters(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
) -> Result<(u64, u64), StateError> {
    let deleted = sqlx::query("DELETE FROM chainstate_filters WHERE id = ? AND from_block > ?")
        .bind(indexer_id)
        .bind(cursor.order_key_i64()?)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("rollback_filters", indexer_id, e))?
        .rows_affected();

    let reopened = sqlx::query("UPDATE chainstate_filters SET to_block = NULL WHERE id = ? AND to_block > ?")
        .bind(indexer_id)
        .bind(cursor.order_key_i64()?)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("rollback_filters", indexer_id, e))?
        .rows_affected();

    if deleted > 0 || reopened > 0 {
        debug!(indexer_id, to = cursor.order_key, deleted, reopened, "filter versions rolled back");
    }
    Ok((deleted, reopened))
}

/// Drop closed versions that ended before the finalized `cursor`.
///
/// Rollbacks never reach below a finalized block, so these can never be
/// reopened.
pub async fn prune_filters(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
) -> Result<u64, StateError> {
    let result = sqlx::query(
        "DELETE FROM chainstate_filters
         WHERE id = ? AND to_block IS NOT NULL AND to_block < ?",
    )
    .bind(indexer_id)
    .bind(cursor.order_key_i64()?)
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("prune_filters", indexer_id, e))?;

    Ok(result.rows_affected())
}

/// Full version history, oldest first.
pub async fn list_filters<F: DeserializeOwned>(
    conn: &mut SqliteConnection,
    indexer_id: &str,
) -> Result<Vec<FilterVersion<F>>, StateError> {
    let rows = sqlx::query(
        "SELECT filter, from_block, to_block FROM chainstate_filters
         WHERE id = ? ORDER BY from_block",
    )
    .bind(indexer_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("list_filters", indexer_id, e))?;

    let mut versions = Vec::with_capacity(rows.len());
    for row in rows {
        let text: String = row
            .try_get("filter")
            .map_err(|e| StateError::persistence("list_filters", indexer_id, e))?;
        let from_block: i64 = row
            .try_get("from_block")
            .map_err(|e| StateError::persistence("list_filters", indexer_id, e))?;
        let to_block: Option<i64> = row
            .try_get("to_block")
            .map_err(|e| StateError::persistence("list_filters", indexer_id, e))?;
        versions.push(FilterVersion {
            filter: serde_json::from_str(&text)
                .map_err(|e| StateError::persistence("list_filters", indexer_id, e))?,
            from_block: from_block as u64,
            to_block: to_block.map(|b| b as u64),
        });
    }
    Ok(versions)
}

/// Delete every version of `indexer_id` (re-indexing).
pub async fn reset_filters(conn: &mut SqliteConnection, indexer_id: &str) -> Result<(), StateError> {
    sqlx::query("DELETE FROM chainstate_filters WHERE id = ?")
        .bind(indexer_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::persistence("reset_filters", indexer_id, e))?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
