//! Lifecycle stages and the consumer handler trait.

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;

use chainstate_core::cursor::Cursor;
use chainstate_core::error::StateResult;
use chainstate_core::types::{Block, Finality, StreamRequest};

/// Trait for user-provided block handlers.
///
/// Called once per block, inside the block's transaction. Everything written
/// through [`BlockContext::conn`] commits or rolls back with the block, and
/// writes to journaled tables are undone if the block is later invalidated.
#[async_trait]
pub trait BlockHandler<D: Send + Sync, F: Send>: Send + Sync {
    async fn handle_block(&self, block: &Block<D>, ctx: &mut BlockContext<'_, F>) -> anyhow::Result<()>;
}

/// What a handler sees while processing one block.
pub struct BlockContext<'a, F> {
    conn: &'a mut SqliteConnection,
    indexer_id: &'a str,
    finality: Finality,
    end_cursor: &'a Cursor,
    derived_filter: Option<F>,
}

impl<'a, F> BlockContext<'a, F> {
    pub(crate) fn new(
        conn: &'a mut SqliteConnection,
        indexer_id: &'a str,
        finality: Finality,
        end_cursor: &'a Cursor,
    ) -> Self {
        Self {
            conn,
            indexer_id,
            finality,
            end_cursor,
            derived_filter: None,
        }
    }

    /// The connection holding the block's open transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
    }

    pub fn indexer_id(&self) -> &str {
        self.indexer_id
    }

    pub fn finality(&self) -> Finality {
        self.finality
    }

    /// Position of the block being processed.
    pub fn end_cursor(&self) -> &Cursor {
        self.end_cursor
    }

    /// Report a new subscription filter derived from this block (factory mode).
    ///
    /// The last call wins. Ignored for pending blocks.
    pub fn derive_filter(&mut self, filter: F) {
        self.derived_filter = Some(filter);
    }

    pub(crate) fn into_derived_filter(self) -> Option<F> {
        self.derived_filter
    }
}

/// Named stages a stream driver calls, in order:
///
/// ```text
/// before_run → ( before_connect → after_connect →
///                ( around_block | on_finalize | on_invalidate )* )*
/// ```
///
/// `on_factory_match` persists a filter that was derived outside a handler.
#[async_trait]
pub trait Lifecycle<F: Send + Sync + 'static>: Send {
    /// One-time startup: migrations, schema, table resolution, cleanup.
    async fn before_run(&mut self) -> StateResult<()>;

    /// Adjust the request before connecting (resume from persisted state).
    async fn before_connect(&mut self, request: StreamRequest<F>) -> StateResult<StreamRequest<F>>;

    /// Discard anything written after the request's starting cursor.
    async fn after_connect(&mut self, request: &StreamRequest<F>) -> StateResult<()>;

    /// Persist a filter derived at `end_cursor`.
    async fn on_factory_match(&mut self, end_cursor: &Cursor, filter: &F) -> StateResult<()>;

    /// Everything at or before `cursor` became irreversible.
    async fn on_finalize(&mut self, cursor: &Cursor) -> StateResult<()>;

    /// Everything after `cursor` is invalid.
    async fn on_invalidate(&mut self, cursor: &Cursor) -> StateResult<()>;

    /// Process one block in its own transaction.
    ///
    /// Returns the filter the handler derived, if the block was committed as
    /// non-pending and derived one; the caller should reconnect with it.
    async fn around_block<D>(
        &mut self,
        block: &Block<D>,
        handler: &dyn BlockHandler<D, F>,
    ) -> StateResult<Option<F>>
    where
        D: Send + Sync + 'static;
}
