//! Statement-building helpers.
//!
//! Identifiers (table, column and trigger names) cannot be bound as
//! parameters, so they go through [`quote_ident`]. Row values are always
//! bound through [`SqlValue::bind`], never interpolated.

use std::fmt;

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{Row, Sqlite};

/// A query with SQLite arguments, as produced by [`sqlx::query`].
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Quote an SQL identifier (`my"table` → `"my""table"`).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal (`it's` → `'it''s'`).
///
/// Only used inside trigger bodies, which cannot take parameters.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// One SQLite value, with its storage class.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// SQL expression that captures `expr` as a `[storage class, value]` JSON
    /// pair. REAL is printed with 17 significant digits and BLOB as hex, so
    /// [`SqlValue::from_captured`] gets back exactly the stored value.
    pub fn capture_sql(expr: &str) -> String {
        format!(
            "json_array(typeof({expr}), CASE typeof({expr}) \
             WHEN 'real' THEN printf('%!.17g', {expr}) \
             WHEN 'blob' THEN hex({expr}) \
             ELSE {expr} END)"
        )
    }

    /// Decode a pair produced by [`SqlValue::capture_sql`].
    pub fn from_captured(captured: &Value) -> Result<Self, String> {
        let (class, value) = match captured.as_array().map(Vec::as_slice) {
            Some([Value::String(class), value]) => (class.as_str(), value),
            _ => return Err(format!("malformed captured value {captured}")),
        };

        let decoded = match (class, value) {
            ("null", _) => Some(Self::Null),
            ("integer", Value::Number(n)) => n.as_i64().map(Self::Integer),
            ("real", Value::String(s)) => s.parse::<f64>().ok().map(Self::Real),
            ("text", Value::String(s)) => Some(Self::Text(s.clone())),
            ("blob", Value::String(s)) => hex::decode(s).ok().map(Self::Blob),
            _ => None,
        };
        decoded.ok_or_else(|| format!("malformed captured {class} value {value}"))
    }

    /// Bind this value as the next parameter of `query`.
    pub fn bind<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Integer(i) => query.bind(*i),
            Self::Real(r) => query.bind(*r),
            Self::Text(s) => query.bind(s.clone()),
            Self::Blob(b) => query.bind(b.clone()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r:?}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

/// Column names of `table` in declaration order (empty if the table does not exist).
pub async fn table_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(|r| r.try_get::<String, _>("name")).collect()
}
