//! Chain reorganization audit log.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use chainstate_core::cursor::Cursor;
use chainstate_core::error::StateError;
use chainstate_core::reorg::ReorgRecord;

/// Append `record` to the log.
pub async fn record_reorg(conn: &mut SqliteConnection, record: &ReorgRecord) -> Result<(), StateError> {
    sqlx::query(
        "INSERT INTO chainstate_chain_reorganizations
            (indexer_id, old_head_order_key, old_head_unique_key,
             new_head_order_key, new_head_unique_key, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.indexer_id)
    .bind(record.old_head.order_key_i64()?)
    .bind(record.old_head.unique_key.as_deref())
    .bind(record.new_head.order_key_i64()?)
    .bind(record.new_head.unique_key.as_deref())
    .bind(record.recorded_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("record_reorg", &record.indexer_id, e))?;
    Ok(())
}

/// Recorded reorgs of `indexer_id`, oldest first.
pub async fn list_reorgs(conn: &mut SqliteConnection, indexer_id: &str) -> Result<Vec<ReorgRecord>, StateError> {
    let rows = sqlx::query(
        "SELECT indexer_id, old_head_order_key, old_head_unique_key,
                new_head_order_key, new_head_unique_key, recorded_at
         FROM chainstate_chain_reorganizations
         WHERE indexer_id = ? ORDER BY id",
    )
    .bind(indexer_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StateError::persistence("list_reorgs", indexer_id, e))?;

    rows.iter()
        .map(|r| {
            Ok(ReorgRecord {
                indexer_id: r.try_get("indexer_id")?,
                old_head: Cursor {
                    order_key: r.try_get::<i64, _>("old_head_order_key")? as u64,
                    unique_key: r.try_get("old_head_unique_key")?,
                },
                new_head: Cursor {
                    order_key: r.try_get::<i64, _>("new_head_order_key")? as u64,
                    unique_key: r.try_get("new_head_unique_key")?,
                },
                recorded_at: r.try_get("recorded_at")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| StateError::persistence("list_reorgs", indexer_id, e))
}
