//! Engine configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Column used as the row identifier when none is configured.
pub const DEFAULT_ID_COLUMN: &str = "id";

/// Key in [`IdColumns::PerTable`] that applies to every unlisted table.
pub const WILDCARD_TABLE: &str = "*";

/// Which column identifies a row in each journaled table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdColumns {
    /// The same column name for every table.
    Uniform(String),
    /// Per-table column names; `"*"` sets the fallback.
    PerTable(HashMap<String, String>),
}

impl IdColumns {
    /// The id column for `table`.
    pub fn column_for(&self, table: &str) -> &str {
        match self {
            Self::Uniform(column) => column,
            Self::PerTable(map) => map
                .get(table)
                .or_else(|| map.get(WILDCARD_TABLE))
                .map(String::as_str)
                .unwrap_or(DEFAULT_ID_COLUMN),
        }
    }
}

impl Default for IdColumns {
    fn default() -> Self {
        Self::Uniform(DEFAULT_ID_COLUMN.to_string())
    }
}

/// Consumer schema migrations run once during startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateOptions {
    /// Directory of `sqlx` migration files (`<version>_<name>.sql`).
    pub migrations_dir: PathBuf,
}

/// Configuration for one indexer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Persist the checkpoint and filter versions (resume after restart).
    pub persist_state: bool,
    /// Indexer name; every state row is partitioned by it.
    pub indexer_name: String,
    /// Consumer tables whose writes are journaled and reversible.
    pub tables: Vec<String>,
    /// Row identifier column(s) for the journaled tables.
    pub id_column: IdColumns,
    /// Consumer migrations to run before anything else.
    pub migrate: Option<MigrateOptions>,
    /// Keep an audit row for every detected chain reorganization.
    pub record_chain_reorganizations: bool,
    /// Wipe consumer tables and identity state on startup.
    pub always_reindex: bool,
    /// Startup attempts before giving up.
    pub init_max_attempts: u32,
    /// Linear backoff step between startup attempts (milliseconds).
    pub init_retry_delay_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            persist_state: true,
            indexer_name: "default".into(),
            tables: Vec::new(),
            id_column: IdColumns::default(),
            migrate: None,
            record_chain_reorganizations: false,
            always_reindex: false,
            init_max_attempts: 5,
            init_retry_delay_ms: 1000,
        }
    }
}

impl StateConfig {
    /// Identity used as the partition key in every state table.
    pub fn indexer_id(&self) -> &str {
        &self.indexer_name
    }

    /// Reject configurations that can never initialize.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.indexer_name.trim().is_empty() {
            return Err(StateError::Config("indexer name must not be empty".into()));
        }
        if self.init_max_attempts == 0 {
            return Err(StateError::Config("init_max_attempts must be at least 1".into()));
        }
        for (i, table) in self.tables.iter().enumerate() {
            if table.trim().is_empty() {
                return Err(StateError::Config(format!("table #{i} has an empty name")));
            }
            if self.tables[..i].contains(table) {
                return Err(StateError::Config(format!("table '{table}' listed twice")));
            }
        }
        Ok(())
    }
}

/// Runtime phase of a state sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkState {
    /// Not yet initialized.
    Idle,
    /// Schema, journal and cleanup done; waiting to connect.
    Ready,
    /// Processing blocks.
    Streaming,
    /// Rolling back after an invalidation signal.
    Invalidating,
    /// Encountered an unrecoverable error.
    Error,
}

impl fmt::Display for SinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Ready => write!(f, "ready"),
            Self::Streaming => write!(f, "streaming"),
            Self::Invalidating => write!(f, "invalidating"),
            Self::Error => write!(f, "error"),
        }
    }
}
