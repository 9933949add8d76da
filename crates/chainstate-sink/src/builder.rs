//! Fluent builder API for state sinks.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainstate_sink::StateConfigBuilder;
//!
//! let config = StateConfigBuilder::new()
//!     .indexer_name("erc20-balances")
//!     .table("transfers")
//!     .table("balances")
//!     .id_column_for("transfers", "tx_id")
//!     .record_chain_reorganizations(true)
//!     .build_config();
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use chainstate_core::config::{IdColumns, MigrateOptions, StateConfig, WILDCARD_TABLE};
use chainstate_core::error::StateResult;
use chainstate_storage::StateDb;

use crate::orchestrator::StateSink;

/// Fluent builder for `StateConfig`.
#[derive(Default)]
pub struct StateConfigBuilder {
    config: StateConfig,
}

impl StateConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StateConfig::default(),
        }
    }

    /// Set the indexer name (partition key of every state row).
    pub fn indexer_name(mut self, name: impl Into<String>) -> Self {
        self.config.indexer_name = name.into();
        self
    }

    /// Persist checkpoint and filter versions (default `true`).
    pub fn persist_state(mut self, persist: bool) -> Self {
        self.config.persist_state = persist;
        self
    }

    /// Journal writes to `table`.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.config.tables.push(table.into());
        self
    }

    /// Journal writes to every table in `tables`.
    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tables.extend(tables.into_iter().map(Into::into));
        self
    }

    /// Use `column` as the row id of every journaled table.
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.config.id_column = IdColumns::Uniform(column.into());
        self
    }

    /// Use `column` as the row id of `table` only.
    pub fn id_column_for(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        let mut map = match std::mem::take(&mut self.config.id_column) {
            IdColumns::Uniform(default) => HashMap::from([(WILDCARD_TABLE.to_string(), default)]),
            IdColumns::PerTable(map) => map,
        };
        map.insert(table.into(), column.into());
        self.config.id_column = IdColumns::PerTable(map);
        self
    }

    /// Run the `sqlx` migrations in `dir` before startup.
    pub fn migrations(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.migrate = Some(MigrateOptions {
            migrations_dir: dir.into(),
        });
        self
    }

    pub fn record_chain_reorganizations(mut self, record: bool) -> Self {
        self.config.record_chain_reorganizations = record;
        self
    }

    /// Wipe journaled tables and identity state on startup.
    pub fn always_reindex(mut self, reindex: bool) -> Self {
        self.config.always_reindex = reindex;
        self
    }

    /// Set startup attempts and the linear backoff step.
    pub fn init_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.config.init_max_attempts = max_attempts;
        self.config.init_retry_delay_ms = delay_ms;
        self
    }

    /// Build the `StateConfig`.
    pub fn build_config(self) -> StateConfig {
        self.config
    }

    /// Build a sink over `db`.
    pub fn build<F>(self, db: StateDb) -> StateResult<StateSink<F>> {
        StateSink::new(db, self.config)
    }
}
