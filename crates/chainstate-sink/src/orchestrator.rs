//! `StateSink` — ties the journal, checkpoint, filter and reorg stores to the
//! stream lifecycle.
//!
//! Every block and every signal is one SQLite transaction. A failure at any
//! step drops the transaction, which rolls back the consumer's writes, the
//! journal entries and the state rows together.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::migrate::Migrator;
use tracing::{debug, info, warn};

use chainstate_core::config::{SinkState, StateConfig};
use chainstate_core::cursor::Cursor;
use chainstate_core::error::{StateError, StateResult};
use chainstate_core::reorg::detect_reorg;
use chainstate_core::types::{Block, Finality, StreamRequest};
use chainstate_storage::journal::{self, JournaledTable};
use chainstate_storage::{checkpoint, commit, filter, reorg, schema, StateDb};

use crate::lifecycle::{BlockContext, BlockHandler, Lifecycle};

/// Reorg-consistent state for one indexer identity.
pub struct StateSink<F> {
    db: StateDb,
    config: StateConfig,
    /// Resolved during `before_run`.
    tables: Vec<JournaledTable>,
    /// Finality of the last committed block. Signals leave it untouched.
    prev_finality: Option<Finality>,
    /// Last committed non-pending cursor.
    last_committed: Option<Cursor>,
    state: SinkState,
    migrated: bool,
    cleaned: bool,
    _filter: PhantomData<fn() -> F>,
}

impl<F> StateSink<F> {
    pub fn new(db: StateDb, config: StateConfig) -> StateResult<Self> {
        config.validate()?;
        Ok(Self {
            db,
            config,
            tables: Vec::new(),
            prev_finality: None,
            last_committed: None,
            state: SinkState::Idle,
            migrated: false,
            cleaned: false,
            _filter: PhantomData,
        })
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    /// Journaled tables (empty before `before_run`).
    pub fn tables(&self) -> &[JournaledTable] {
        &self.tables
    }

    /// Last committed non-pending cursor.
    pub fn last_committed(&self) -> Option<&Cursor> {
        self.last_committed.as_ref()
    }

    fn indexer_id(&self) -> &str {
        self.config.indexer_id()
    }

    /// Mark the sink failed if `result` is an error.
    fn track<T>(&mut self, result: StateResult<T>) -> StateResult<T> {
        if result.is_err() {
            self.state = SinkState::Error;
        }
        result
    }

    /// One initialization attempt.
    async fn initialize(&mut self) -> StateResult<()> {
        if let (Some(migrate), false) = (&self.config.migrate, self.migrated) {
            let dir = migrate.migrations_dir.clone();
            let migrator = Migrator::new(dir.clone())
                .await
                .map_err(|e| StateError::Storage(format!("load migrations from {}: {e}", dir.display())))?;
            migrator
                .run(self.db.pool())
                .await
                .map_err(|e| StateError::Storage(format!("run migrations: {e}")))?;
            // Applied migrations are committed even if the rest of this attempt fails.
            self.migrated = true;
        }

        let id = self.indexer_id().to_string();
        let persist = self.config.persist_state;
        let mut tx = self.db.begin().await?;

        journal::ensure_journal_table(&mut tx).await?;
        if persist {
            schema::initialize_state_schema(&mut tx).await?;
        }

        let mut tables = Vec::with_capacity(self.config.tables.len());
        for name in &self.config.tables {
            let id_column = self.config.id_column.column_for(name);
            tables.push(journal::resolve_table(&mut tx, name, id_column).await?);
        }

        let reindex = self.config.always_reindex && !self.cleaned;
        if reindex {
            journal::truncate_tables(&mut tx, &tables).await?;
            journal::reset_journal(&mut tx, &id).await?;
            if persist {
                checkpoint::reset_checkpoint(&mut tx, &id).await?;
                filter::reset_filters(&mut tx, &id).await?;
            }
        }

        commit(tx).await?;

        self.tables = tables;
        if reindex {
            self.cleaned = true;
            info!(indexer_id = %id, tables = self.tables.len(), "state reset for re-indexing");
        }
        Ok(())
    }

    async fn process_block<D>(
        &mut self,
        block: &Block<D>,
        handler: &dyn BlockHandler<D, F>,
    ) -> StateResult<Option<F>>
    where
        D: Send + Sync + 'static,
        F: Serialize + Send + Sync + 'static,
    {
        let id = self.config.indexer_id().to_string();
        let mut tx = self.db.begin().await?;

        if self.prev_finality == Some(Finality::Pending) {
            let target = match (&block.cursor, &self.last_committed) {
                (Some(cursor), Some(committed)) => Some(cursor.min_position(committed).clone()),
                (Some(cursor), None) => Some(cursor.clone()),
                (None, committed) => committed.clone(),
            };
            let replayed = match &target {
                Some(cursor) => journal::invalidate(&mut tx, &id, cursor, &self.tables).await?,
                None => journal::invalidate_all(&mut tx, &id, &self.tables).await?,
            };
            debug!(indexer_id = %id, replayed, "pending block superseded");
        }

        let journaled = block.finality.is_reversible() && !self.tables.is_empty();
        if journaled {
            journal::arm(&mut tx, &id, &block.end_cursor, &self.tables).await?;
        }

        let mut ctx = BlockContext::new(&mut tx, &id, block.finality, &block.end_cursor);
        let outcome = handler.handle_block(block, &mut ctx).await;
        let derived = ctx.into_derived_filter();
        outcome.map_err(|source| StateError::Consumer {
            order_key: block.number(),
            source,
        })?;

        if journaled {
            journal::disarm(&mut tx, &self.tables).await?;
        }

        let committed = block.finality.advances_checkpoint();
        if committed && self.config.persist_state {
            checkpoint::set_checkpoint(&mut tx, &id, &block.end_cursor).await?;
            if let Some(filter) = &derived {
                filter::append_or_extend_filter(&mut tx, &id, &block.end_cursor, filter).await?;
            }
        }

        commit(tx).await?;

        self.prev_finality = Some(block.finality);
        debug!(
            indexer_id = %id,
            block = block.number(),
            finality = %block.finality,
            derived_filter = derived.is_some(),
            "block committed"
        );

        if committed {
            self.last_committed = Some(block.end_cursor.clone());
            Ok(derived)
        } else {
            Ok(None)
        }
    }

    async fn invalidate(&mut self, cursor: &Cursor) -> StateResult<()> {
        let id = self.indexer_id().to_string();
        let persist = self.config.persist_state;
        let mut tx = self.db.begin().await?;

        let prior = if persist {
            checkpoint::get_checkpoint(&mut tx, &id).await?
        } else {
            self.last_committed.clone()
        };
        if let Some(record) = detect_reorg(&id, prior.as_ref(), cursor) {
            if self.config.record_chain_reorganizations && persist {
                reorg::record_reorg(&mut tx, &record).await?;
            }
        }

        let replayed = journal::invalidate(&mut tx, &id, cursor, &self.tables).await?;
        if persist {
            filter::rollback_filters(&mut tx, &id, cursor).await?;
            checkpoint::rollback_checkpoint(&mut tx, &id, cursor).await?;
        }

        commit(tx).await?;

        if self.last_committed.as_ref().is_some_and(|c| c.is_after(cursor)) {
            self.last_committed = Some(cursor.clone());
        }
        info!(indexer_id = %id, to = %cursor, replayed, "state invalidated");
        Ok(())
    }
}

#[async_trait]
impl<F> Lifecycle<F> for StateSink<F>
where
    F: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn before_run(&mut self) -> StateResult<()> {
        let max_attempts = self.config.init_max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.initialize().await {
                Ok(()) => {
                    self.state = SinkState::Ready;
                    info!(
                        indexer_id = self.indexer_id(),
                        tables = self.tables.len(),
                        persist_state = self.config.persist_state,
                        "state sink initialized"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                self.state = SinkState::Error;
                return Err(err);
            }
            if attempt >= max_attempts {
                self.state = SinkState::Error;
                return Err(StateError::Initialization {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = Duration::from_millis(self.config.init_retry_delay_ms.saturating_mul(attempt as u64));
            warn!(
                indexer_id = self.indexer_id(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "initialization failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn before_connect(&mut self, mut request: StreamRequest<F>) -> StateResult<StreamRequest<F>> {
        if !self.config.persist_state {
            return Ok(request);
        }

        let id = self.indexer_id().to_string();
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| StateError::Storage(format!("acquire connection: {e}")))?;
        let loaded = checkpoint::get_checkpoint(&mut conn, &id).await;
        let loaded = self.track(loaded)?;
        let active = filter::get_active_filter::<F>(&mut conn, &id).await;
        let active = self.track(active)?;
        drop(conn);

        if let Some(cursor) = loaded {
            info!(indexer_id = %id, cursor = %cursor, "resuming from checkpoint");
            self.last_committed = Some(cursor.clone());
            request.starting_cursor = Some(cursor);
        }
        if let Some(filter) = active {
            request.filter = Some(filter);
        }
        Ok(request)
    }

    async fn after_connect(&mut self, request: &StreamRequest<F>) -> StateResult<()> {
        if let Some(cursor) = &request.starting_cursor {
            let id = self.indexer_id().to_string();
            let persist = self.config.persist_state;
            let result = async {
                let mut tx = self.db.begin().await?;
                let replayed = journal::invalidate(&mut tx, &id, cursor, &self.tables).await?;
                if persist {
                    filter::rollback_filters(&mut tx, &id, cursor).await?;
                    checkpoint::rollback_checkpoint(&mut tx, &id, cursor).await?;
                }
                commit(tx).await?;
                Ok::<_, StateError>(replayed)
            }
            .await;
            let replayed = self.track(result)?;
            if replayed > 0 {
                info!(indexer_id = %id, to = %cursor, replayed, "uncommitted stream tail discarded");
            }
            if self.last_committed.as_ref().is_some_and(|c| c.is_after(cursor)) {
                self.last_committed = Some(cursor.clone());
            }
        }
        self.state = SinkState::Streaming;
        Ok(())
    }

    async fn on_factory_match(&mut self, end_cursor: &Cursor, filter: &F) -> StateResult<()> {
        if !self.config.persist_state {
            return Ok(());
        }
        let id = self.indexer_id().to_string();
        let result = async {
            let mut tx = self.db.begin().await?;
            filter::append_or_extend_filter(&mut tx, &id, end_cursor, filter).await?;
            commit(tx).await?;
            Ok::<_, StateError>(())
        }
        .await;
        self.track(result)
    }

    async fn on_finalize(&mut self, cursor: &Cursor) -> StateResult<()> {
        let id = self.indexer_id().to_string();
        let persist = self.config.persist_state;
        let result = async {
            let mut tx = self.db.begin().await?;
            let purged = journal::finalize(&mut tx, &id, cursor).await?;
            let pruned = if persist {
                filter::prune_filters(&mut tx, &id, cursor).await?
            } else {
                0
            };
            commit(tx).await?;
            Ok::<_, StateError>((purged, pruned))
        }
        .await;
        let (purged, pruned) = self.track(result)?;
        debug!(indexer_id = %id, cursor = %cursor, purged, pruned, "finalized");
        Ok(())
    }

    async fn on_invalidate(&mut self, cursor: &Cursor) -> StateResult<()> {
        self.state = SinkState::Invalidating;
        let result = self.invalidate(cursor).await;
        self.track(result)?;
        self.state = SinkState::Streaming;
        Ok(())
    }

    async fn around_block<D>(
        &mut self,
        block: &Block<D>,
        handler: &dyn BlockHandler<D, F>,
    ) -> StateResult<Option<F>>
    where
        D: Send + Sync + 'static,
    {
        let result = self.process_block(block, handler).await;
        self.track(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StateConfig {
        StateConfig {
            indexer_name: "unit".into(),
            tables: vec!["balances".into()],
            init_retry_delay_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let db = StateDb::in_memory().await.unwrap();
        let cfg = StateConfig {
            init_max_attempts: 0,
            ..config()
        };
        assert!(matches!(StateSink::<()>::new(db, cfg), Err(StateError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_table_is_not_retried() {
        let db = StateDb::in_memory().await.unwrap();
        let mut sink = StateSink::<()>::new(db, config()).unwrap();

        let err = sink.before_run().await.unwrap_err();
        assert!(matches!(err, StateError::Config(_)));
        assert_eq!(sink.state(), SinkState::Error);
    }

    #[tokio::test]
    async fn missing_migrations_exhaust_retries() {
        let db = StateDb::in_memory().await.unwrap();
        let cfg = StateConfig {
            tables: vec![],
            init_max_attempts: 2,
            migrate: Some(chainstate_core::config::MigrateOptions {
                migrations_dir: "/nonexistent/chainstate/migrations".into(),
            }),
            ..config()
        };
        let mut sink = StateSink::<()>::new(db, cfg).unwrap();

        let err = sink.before_run().await.unwrap_err();
        assert!(matches!(err, StateError::Initialization { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn ready_after_init_without_tables() {
        let db = StateDb::in_memory().await.unwrap();
        let cfg = StateConfig {
            tables: vec![],
            ..config()
        };
        let mut sink = StateSink::<()>::new(db, cfg).unwrap();
        sink.before_run().await.unwrap();
        assert_eq!(sink.state(), SinkState::Ready);
        assert!(sink.tables().is_empty());
    }
}
