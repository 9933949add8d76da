//! Change journal — makes consumer writes reversible.
//!
//! While a non-finalized block is being processed, connection-scoped
//! `TEMP` triggers on every journaled table append one entry per row
//! mutation to `chainstate_reorg_rollback`:
//!
//! | op | `row_id`       | `row_value`            |
//! |----|----------------|------------------------|
//! | I  | `NEW.<id>`     | `NULL`                 |
//! | U  | `OLD.<id>`     | full pre-image (JSON)  |
//! | D  | `OLD.<id>`     | full pre-image (JSON)  |
//!
//! Every captured value is a `[storage class, value]` pair (see
//! [`SqlValue::capture_sql`]), so REAL and BLOB columns come back bit-exact.
//!
//! The triggers read the indexer id and cursor from the temp table
//! `chainstate_journal_context`, which is written with bound parameters, so
//! the trigger DDL never changes between blocks and never embeds values.
//!
//! Invalidation removes every entry after the rollback cursor and applies
//! the inverse operations newest-first. Finalization drops entries that can
//! no longer be invalidated.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use chainstate_core::cursor::Cursor;
use chainstate_core::error::StateError;

use crate::sql::{quote_ident, quote_literal, table_columns, SqlValue};

/// Journal relation.
pub const JOURNAL_TABLE: &str = "chainstate_reorg_rollback";

/// `json_object` takes at most 127 arguments (two per column).
pub const MAX_JOURNALED_COLUMNS: usize = 63;

// ─── Types ────────────────────────────────────────────────────────────────────

/// Kind of row mutation captured by the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Insert,
    Update,
    Delete,
}

impl JournalOp {
    const ALL: [JournalOp; 3] = [Self::Insert, Self::Update, Self::Delete];

    /// Single-letter code stored in the `op` column.
    pub fn code(self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }

    fn trigger_event(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    fn trigger_suffix(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A consumer table whose writes are journaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledTable {
    pub name: String,
    pub id_column: String,
    /// All columns, in declaration order.
    pub columns: Vec<String>,
}

impl JournaledTable {
    fn trigger_name(&self, op: JournalOp) -> String {
        quote_ident(&format!("chainstate_journal_{}_{}", self.name, op.trigger_suffix()))
    }

    /// `CREATE TEMP TRIGGER` statement capturing `op` on this table.
    fn create_trigger_sql(&self, op: JournalOp) -> String {
        let id = quote_ident(&self.id_column);
        let (row_id, row_value) = match op {
            JournalOp::Insert => (SqlValue::capture_sql(&format!("NEW.{id}")), "NULL".to_string()),
            JournalOp::Update | JournalOp::Delete => {
                let pairs = self
                    .columns
                    .iter()
                    .map(|c| {
                        let old = SqlValue::capture_sql(&format!("OLD.{}", quote_ident(c)));
                        format!("{}, {old}", quote_literal(c))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                (SqlValue::capture_sql(&format!("OLD.{id}")), format!("json_object({pairs})"))
            }
        };

        // Trigger bodies may not use qualified names; the unqualified context
        // table resolves to the temp schema.
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {trigger}
             AFTER {event} ON {table}
             FOR EACH ROW BEGIN
                INSERT INTO {JOURNAL_TABLE} (op, table_name, cursor, row_id, row_value, indexer_id)
                SELECT {op}, {table_name}, ctx.cursor, {row_id}, {row_value}, ctx.indexer_id
                FROM chainstate_journal_context AS ctx;
             END",
            trigger = self.trigger_name(op),
            event = op.trigger_event(),
            table = quote_ident(&self.name),
            op = quote_literal(op.code()),
            table_name = quote_literal(&self.name),
        )
    }
}

/// One journaled row mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Monotonic sequence; replay order.
    pub sequence: i64,
    pub op: JournalOp,
    pub table_name: String,
    /// Order key of the block that caused the mutation.
    pub order_key: u64,
    pub row_id: Option<SqlValue>,
    /// Pre-image for updates and deletes.
    pub row_value: Option<BTreeMap<String, SqlValue>>,
}

impl JournalEntry {
    fn from_row(row: &SqliteRow) -> Result<Self, String> {
        let code: String = row.try_get("op").map_err(|e| e.to_string())?;
        let op = JournalOp::from_code(&code).ok_or_else(|| format!("unknown journal op '{code}'"))?;

        let row_id = row
            .try_get::<Option<String>, _>("row_id")
            .map_err(|e| e.to_string())?
            .map(|text| {
                let captured = serde_json::from_str::<Value>(&text).map_err(|e| e.to_string())?;
                SqlValue::from_captured(&captured)
            })
            .transpose()
            .map_err(|e| format!("decode row_id: {e}"))?;

        let row_value = row
            .try_get::<Option<String>, _>("row_value")
            .map_err(|e| e.to_string())?
            .map(|text| decode_pre_image(&text))
            .transpose()
            .map_err(|e| format!("decode row_value: {e}"))?;

        Ok(Self {
            sequence: row.try_get("n").map_err(|e| e.to_string())?,
            op,
            table_name: row.try_get("table_name").map_err(|e| e.to_string())?,
            order_key: row.try_get::<i64, _>("cursor").map_err(|e| e.to_string())? as u64,
            row_id,
            row_value,
        })
    }
}

fn decode_pre_image(text: &str) -> Result<BTreeMap<String, SqlValue>, String> {
    let columns = serde_json::from_str::<serde_json::Map<String, Value>>(text).map_err(|e| e.to_string())?;
    columns
        .iter()
        .map(|(column, captured)| {
            SqlValue::from_captured(captured)
                .map(|value| (column.clone(), value))
                .map_err(|e| format!("column '{column}': {e}"))
        })
        .collect()
}

// ─── Setup ────────────────────────────────────────────────────────────────────

/// Create the journal relation if absent.
pub async fn ensure_journal_table(conn: &mut SqliteConnection) -> Result<(), StateError> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {JOURNAL_TABLE} (
            n          INTEGER PRIMARY KEY AUTOINCREMENT,
            op         TEXT    NOT NULL CHECK (op IN ('I', 'U', 'D')),
            table_name TEXT    NOT NULL,
            cursor     INTEGER NOT NULL,
            row_id     TEXT,
            row_value  TEXT,
            indexer_id TEXT    NOT NULL
        )"
    ))
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::journal("ensure_journal_table", e))?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_chainstate_reorg_rollback_cursor
         ON {JOURNAL_TABLE} (indexer_id, cursor)"
    ))
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::journal("ensure_journal_table", e))?;

    Ok(())
}

/// Look up `name` and check it can be journaled with `id_column`.
pub async fn resolve_table(
    conn: &mut SqliteConnection,
    name: &str,
    id_column: &str,
) -> Result<JournaledTable, StateError> {
    let columns = table_columns(conn, name)
        .await
        .map_err(|e| StateError::journal("resolve_table", e))?;

    if columns.is_empty() {
        return Err(StateError::Config(format!("table '{name}' does not exist")));
    }
    if !columns.iter().any(|c| c == id_column) {
        return Err(StateError::Config(format!(
            "table '{name}' has no id column '{id_column}'"
        )));
    }
    if columns.len() > MAX_JOURNALED_COLUMNS {
        return Err(StateError::Config(format!(
            "table '{name}' has {} columns; at most {MAX_JOURNALED_COLUMNS} can be journaled",
            columns.len()
        )));
    }

    Ok(JournaledTable {
        name: name.to_string(),
        id_column: id_column.to_string(),
        columns,
    })
}

/// Delete every row of every journaled table (re-indexing).
pub async fn truncate_tables(
    conn: &mut SqliteConnection,
    tables: &[JournaledTable],
) -> Result<(), StateError> {
    for table in tables {
        sqlx::query(&format!("DELETE FROM {}", quote_ident(&table.name)))
            .execute(&mut *conn)
            .await
            .map_err(|e| StateError::journal("truncate_tables", e))?;
    }
    Ok(())
}

// ─── Arming ───────────────────────────────────────────────────────────────────

/// Start capturing writes to `tables`, tagged with `cursor`.
pub async fn arm(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
    tables: &[JournaledTable],
) -> Result<(), StateError> {
    sqlx::query(
        "CREATE TEMP TABLE IF NOT EXISTS chainstate_journal_context (
            indexer_id TEXT    NOT NULL,
            cursor     INTEGER NOT NULL
        )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::journal("arm", e))?;

    sqlx::query("DELETE FROM temp.chainstate_journal_context")
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::journal("arm", e))?;

    sqlx::query("INSERT INTO temp.chainstate_journal_context (indexer_id, cursor) VALUES (?, ?)")
        .bind(indexer_id)
        .bind(cursor.order_key_i64()?)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::journal("arm", e))?;

    for table in tables {
        for op in JournalOp::ALL {
            sqlx::query(&table.create_trigger_sql(op))
                .execute(&mut *conn)
                .await
                .map_err(|e| StateError::journal("arm", format!("trigger on '{}': {e}", table.name)))?;
        }
    }
    Ok(())
}

/// Stop capturing writes to `tables`.
pub async fn disarm(conn: &mut SqliteConnection, tables: &[JournaledTable]) -> Result<(), StateError> {
    for table in tables {
        for op in JournalOp::ALL {
            sqlx::query(&format!("DROP TRIGGER IF EXISTS temp.{}", table.trigger_name(op)))
                .execute(&mut *conn)
                .await
                .map_err(|e| StateError::journal("disarm", e))?;
        }
    }

    // The context table only exists once `arm` has run on this connection.
    sqlx::query("DROP TABLE IF EXISTS temp.chainstate_journal_context")
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::journal("disarm", e))?;
    Ok(())
}

// ─── Invalidation ─────────────────────────────────────────────────────────────

/// Undo every journaled write after `cursor`.
///
/// Must run with journaling disarmed, inside the caller's transaction: on
/// error the caller rolls back and the store is left as before. Returns the
/// number of entries replayed.
pub async fn invalidate(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
    tables: &[JournaledTable],
) -> Result<u64, StateError> {
    let after = cursor.order_key_i64()?;
    replay_after(conn, indexer_id, after, tables)
        .await
        .map_err(|reason| StateError::Invalidation {
            indexer_id: indexer_id.to_string(),
            order_key: cursor.order_key,
            reason,
        })
}

/// Undo every journaled write of `indexer_id` regardless of cursor.
///
/// Used when a pending block is superseded before anything was committed.
pub async fn invalidate_all(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    tables: &[JournaledTable],
) -> Result<u64, StateError> {
    replay_after(conn, indexer_id, -1, tables)
        .await
        .map_err(|reason| StateError::Invalidation {
            indexer_id: indexer_id.to_string(),
            order_key: 0,
            reason,
        })
}

async fn replay_after(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    after: i64,
    tables: &[JournaledTable],
) -> Result<u64, String> {
    // Select and delete in one statement: every entry is replayed at most once.
    let rows = sqlx::query(&format!(
        "DELETE FROM {JOURNAL_TABLE}
         WHERE indexer_id = ? AND cursor > ?
         RETURNING n, op, table_name, cursor, row_id, row_value"
    ))
    .bind(indexer_id)
    .bind(after)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| format!("read journal: {e}"))?;

    let mut entries = rows
        .iter()
        .map(JournalEntry::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    // Newest first: each pre-image must land on the state it was taken from.
    entries.sort_unstable_by(|a, b| b.sequence.cmp(&a.sequence));

    for entry in &entries {
        let table = tables
            .iter()
            .find(|t| t.name == entry.table_name)
            .ok_or_else(|| format!("journal entry {} targets unknown table '{}'", entry.sequence, entry.table_name))?;
        apply_inverse(conn, table, entry).await?;
    }

    if !entries.is_empty() {
        info!(indexer_id, after, replayed = entries.len(), "journal replayed");
    }
    Ok(entries.len() as u64)
}

async fn apply_inverse(
    conn: &mut SqliteConnection,
    table: &JournaledTable,
    entry: &JournalEntry,
) -> Result<(), String> {
    let row_id = entry
        .row_id
        .as_ref()
        .ok_or_else(|| format!("journal entry {} has no row id", entry.sequence))?;
    let table_ident = quote_ident(&table.name);
    let id_ident = quote_ident(&table.id_column);

    match entry.op {
        JournalOp::Insert => {
            let sql = format!("DELETE FROM {table_ident} WHERE {id_ident} = ?");
            row_id
                .bind(sqlx::query(&sql))
                .execute(&mut *conn)
                .await
                .map_err(|e| format!("undo insert into '{}': {e}", table.name))?;
        }
        JournalOp::Delete => {
            let image = pre_image(entry)?;
            let columns = image.keys().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
            let params = vec!["?"; image.len()].join(", ");
            let sql = format!("INSERT INTO {table_ident} ({columns}) VALUES ({params})");

            let mut query = sqlx::query(&sql);
            for value in image.values() {
                query = value.bind(query);
            }
            query
                .execute(&mut *conn)
                .await
                .map_err(|e| format!("undo delete from '{}': {e}", table.name))?;
        }
        JournalOp::Update => {
            let image = pre_image(entry)?;
            let assignments: Vec<(&String, &SqlValue)> =
                image.iter().filter(|(c, _)| **c != table.id_column).collect();
            if assignments.is_empty() {
                return Ok(());
            }
            let set = assignments
                .iter()
                .map(|(c, _)| format!("{} = ?", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("UPDATE {table_ident} SET {set} WHERE {id_ident} = ?");

            let mut query = sqlx::query(&sql);
            for (_, value) in &assignments {
                query = value.bind(query);
            }
            row_id
                .bind(query)
                .execute(&mut *conn)
                .await
                .map_err(|e| format!("undo update of '{}': {e}", table.name))?;
        }
    }
    Ok(())
}

fn pre_image(entry: &JournalEntry) -> Result<&BTreeMap<String, SqlValue>, String> {
    entry
        .row_value
        .as_ref()
        .ok_or_else(|| format!("journal entry {} has no pre-image", entry.sequence))
}

// ─── Finalization & inspection ────────────────────────────────────────────────

/// Drop entries at or before the finalized `cursor`. Returns rows removed.
pub async fn finalize(
    conn: &mut SqliteConnection,
    indexer_id: &str,
    cursor: &Cursor,
) -> Result<u64, StateError> {
    let result = sqlx::query(&format!(
        "DELETE FROM {JOURNAL_TABLE} WHERE indexer_id = ? AND cursor <= ?"
    ))
    .bind(indexer_id)
    .bind(cursor.order_key_i64()?)
    .execute(&mut *conn)
    .await
    .map_err(|e| StateError::journal("finalize", e))?;

    debug!(indexer_id, cursor = %cursor, removed = result.rows_affected(), "journal finalized");
    Ok(result.rows_affected())
}

/// All entries of `indexer_id`, oldest first.
pub async fn entries(
    conn: &mut SqliteConnection,
    indexer_id: &str,
) -> Result<Vec<JournalEntry>, StateError> {
    let rows = sqlx::query(&format!(
        "SELECT n, op, table_name, cursor, row_id, row_value FROM {JOURNAL_TABLE}
         WHERE indexer_id = ? ORDER BY n"
    ))
    .bind(indexer_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StateError::journal("entries", e))?;

    rows.iter()
        .map(JournalEntry::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StateError::journal("entries", e))
}

/// Number of entries of `indexer_id`.
pub async fn count_entries(conn: &mut SqliteConnection, indexer_id: &str) -> Result<u64, StateError> {
    let (n,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM {JOURNAL_TABLE} WHERE indexer_id = ?"
    ))
    .bind(indexer_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| StateError::journal("count_entries", e))?;
    Ok(n as u64)
}

/// Delete every entry of `indexer_id` (re-indexing).
pub async fn reset_journal(conn: &mut SqliteConnection, indexer_id: &str) -> Result<(), StateError> {
    sqlx::query(&format!("DELETE FROM {JOURNAL_TABLE} WHERE indexer_id = ?"))
        .bind(indexer_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StateError::journal("reset_journal", e))?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateDb;
    use sqlx::pool::PoolConnection;
    use sqlx::Sqlite;

    async fn setup() -> (StateDb, Vec<JournaledTable>) {
        let db = StateDb::in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        ensure_journal_table(&mut conn).await.unwrap();
        sqlx::query("CREATE TABLE balances (id TEXT PRIMARY KEY, owner TEXT NOT NULL, amount INTEGER NOT NULL)")
            .execute(&mut *conn)
            .await
            .unwrap();
        let table = resolve_table(&mut conn, "balances", "id").await.unwrap();
        (db, vec![table])
    }

    async fn write(conn: &mut PoolConnection<Sqlite>, sql: &str) {
        sqlx::query(sql).execute(&mut **conn).await.unwrap();
    }

    async fn balance(conn: &mut PoolConnection<Sqlite>, id: &str) -> Option<(String, i64)> {
        sqlx::query_as("SELECT owner, amount FROM balances WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **conn)
            .await
            .unwrap()
    }

    /// Run `sql` as block `order_key`, journaled.
    async fn journaled(conn: &mut PoolConnection<Sqlite>, tables: &[JournaledTable], order_key: u64, sql: &str) {
        arm(conn, "idx", &Cursor::new(order_key), tables).await.unwrap();
        write(conn, sql).await;
        disarm(conn, tables).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_table_and_id() {
        let (db, _) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(matches!(resolve_table(&mut conn, "nope", "id").await, Err(StateError::Config(_))));
        assert!(matches!(resolve_table(&mut conn, "balances", "pk").await, Err(StateError::Config(_))));
    }

    #[tokio::test]
    async fn captures_each_operation() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        journaled(&mut conn, &tables, 1, "INSERT INTO balances VALUES ('a', 'alice', 10)").await;
        journaled(&mut conn, &tables, 2, "UPDATE balances SET amount = 20 WHERE id = 'a'").await;
        journaled(&mut conn, &tables, 3, "DELETE FROM balances WHERE id = 'a'").await;

        let log = entries(&mut conn, "idx").await.unwrap();
        assert_eq!(log.iter().map(|e| e.op).collect::<Vec<_>>(), vec![JournalOp::Insert, JournalOp::Update, JournalOp::Delete]);
        assert_eq!(log.iter().map(|e| e.order_key).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(log[0].row_id, Some(SqlValue::Text("a".into())));
        assert_eq!(log[0].row_value, None);
        assert_eq!(log[1].row_value.as_ref().unwrap()["amount"], SqlValue::Integer(10));
        assert_eq!(log[2].row_value.as_ref().unwrap()["amount"], SqlValue::Integer(20));
    }

    #[tokio::test]
    async fn disarmed_writes_are_not_captured() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        write(&mut conn, "INSERT INTO balances VALUES ('a', 'alice', 10)").await;
        journaled(&mut conn, &tables, 1, "UPDATE balances SET amount = 11 WHERE id = 'a'").await;
        write(&mut conn, "UPDATE balances SET amount = 12 WHERE id = 'a'").await;

        assert_eq!(count_entries(&mut conn, "idx").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalidation_reverses_dependent_updates() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        journaled(&mut conn, &tables, 1, "INSERT INTO balances VALUES ('a', 'alice', 10)").await;
        journaled(&mut conn, &tables, 2, "UPDATE balances SET amount = 20 WHERE id = 'a'").await;
        journaled(&mut conn, &tables, 3, "UPDATE balances SET amount = 30, owner = 'bob' WHERE id = 'a'").await;

        let replayed = invalidate(&mut conn, "idx", &Cursor::new(1), &tables).await.unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(balance(&mut conn, "a").await, Some(("alice".into(), 10)));

        invalidate(&mut conn, "idx", &Cursor::new(0), &tables).await.unwrap();
        assert_eq!(balance(&mut conn, "a").await, None);
        assert_eq!(count_entries(&mut conn, "idx").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalidation_restores_deleted_rows() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();

        journaled(&mut conn, &tables, 1, "INSERT INTO balances VALUES ('a', 'it''s me', 10)").await;
        journaled(&mut conn, &tables, 2, "DELETE FROM balances WHERE id = 'a'").await;
        assert_eq!(balance(&mut conn, "a").await, None);

        invalidate(&mut conn, "idx", &Cursor::new(1), &tables).await.unwrap();
        assert_eq!(balance(&mut conn, "a").await, Some(("it's me".into(), 10)));
    }

    #[tokio::test]
    async fn several_writes_in_one_block_unwind_together() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        write(&mut conn, "INSERT INTO balances VALUES ('a', 'alice', 1)").await;

        arm(&mut conn, "idx", &Cursor::new(5), &tables).await.unwrap();
        write(&mut conn, "UPDATE balances SET amount = 2 WHERE id = 'a'").await;
        write(&mut conn, "UPDATE balances SET amount = 3 WHERE id = 'a'").await;
        write(&mut conn, "INSERT INTO balances VALUES ('b', 'bob', 7)").await;
        disarm(&mut conn, &tables).await.unwrap();

        invalidate(&mut conn, "idx", &Cursor::new(4), &tables).await.unwrap();
        assert_eq!(balance(&mut conn, "a").await, Some(("alice".into(), 1)));
        assert_eq!(balance(&mut conn, "b").await, None);
    }

    /// A journaled table with REAL and BLOB columns.
    async fn prices(conn: &mut PoolConnection<Sqlite>) -> Vec<JournaledTable> {
        write(conn, "CREATE TABLE prices (id BLOB PRIMARY KEY, price REAL, tx_hash BLOB)").await;
        vec![resolve_table(conn, "prices", "id").await.unwrap()]
    }

    async fn price_row(conn: &mut PoolConnection<Sqlite>) -> Option<(f64, Vec<u8>)> {
        sqlx::query_as("SELECT price, tx_hash FROM prices WHERE id = x'01'")
            .fetch_optional(&mut **conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn real_values_are_restored_exactly() {
        let (db, _) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let tables = prices(&mut conn).await;

        journaled(&mut conn, &tables, 1, "INSERT INTO prices VALUES (x'01', 0.1 + 0.2, x'aa')").await;
        journaled(&mut conn, &tables, 2, "UPDATE prices SET price = 5.0 WHERE id = x'01'").await;

        invalidate(&mut conn, "idx", &Cursor::new(1), &tables).await.unwrap();
        let (price, _) = price_row(&mut conn).await.unwrap();
        assert_eq!(price.to_bits(), (0.1_f64 + 0.2).to_bits());
    }

    #[tokio::test]
    async fn blob_rows_are_journaled_and_restored() {
        let (db, _) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let tables = prices(&mut conn).await;
        let hash = vec![0xde, 0xad, 0x00, 0xbe, 0xef];

        write(&mut conn, "INSERT INTO prices VALUES (x'01', 1.5, x'dead00beef')").await;
        journaled(&mut conn, &tables, 2, "UPDATE prices SET tx_hash = x'ff' WHERE id = x'01'").await;
        journaled(&mut conn, &tables, 3, "DELETE FROM prices WHERE id = x'01'").await;

        let log = entries(&mut conn, "idx").await.unwrap();
        assert_eq!(log[0].row_id, Some(SqlValue::Blob(vec![0x01])));
        assert_eq!(log[0].row_value.as_ref().unwrap()["tx_hash"], SqlValue::Blob(hash.clone()));

        invalidate(&mut conn, "idx", &Cursor::new(2), &tables).await.unwrap();
        assert_eq!(price_row(&mut conn).await, Some((1.5, vec![0xff])));

        invalidate(&mut conn, "idx", &Cursor::new(1), &tables).await.unwrap();
        assert_eq!(price_row(&mut conn).await, Some((1.5, hash)));
    }

    #[tokio::test]
    async fn invalidate_all_ignores_cursor() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        journaled(&mut conn, &tables, 0, "INSERT INTO balances VALUES ('a', 'alice', 1)").await;

        assert_eq!(invalidate_all(&mut conn, "idx", &tables).await.unwrap(), 1);
        assert_eq!(balance(&mut conn, "a").await, None);
    }

    #[tokio::test]
    async fn finalize_purges_only_old_entries() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        for (block, id) in [(1, "a"), (2, "b"), (3, "c")] {
            let sql = format!("INSERT INTO balances VALUES ('{id}', 'x', {block})");
            journaled(&mut conn, &tables, block, &sql).await;
        }

        assert_eq!(finalize(&mut conn, "idx", &Cursor::new(2)).await.unwrap(), 2);
        let left = entries(&mut conn, "idx").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].order_key, 3);
    }

    #[tokio::test]
    async fn identities_do_not_share_entries() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        journaled(&mut conn, &tables, 5, "INSERT INTO balances VALUES ('a', 'alice', 1)").await;

        assert_eq!(invalidate(&mut conn, "other", &Cursor::new(0), &tables).await.unwrap(), 0);
        assert_eq!(balance(&mut conn, "a").await, Some(("alice".into(), 1)));
    }

    #[tokio::test]
    async fn unknown_table_aborts_replay() {
        let (db, tables) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        journaled(&mut conn, &tables, 5, "INSERT INTO balances VALUES ('a', 'alice', 1)").await;

        let err = invalidate(&mut conn, "idx", &Cursor::new(0), &[]).await.unwrap_err();
        assert!(matches!(err, StateError::Invalidation { order_key: 0, .. }));
    }
}
