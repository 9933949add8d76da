//! chainstate-storage — SQLite state store for ChainState.
//!
//! Everything the engine persists lives in the same database as the
//! consumer's tables, so one transaction covers both:
//!
//! - [`schema`] — versioned state schema with forward migrations
//! - [`checkpoint`] — last committed cursor per indexer identity
//! - [`filter`] — time-ranged filter versions (factory mode)
//! - [`journal`] — trigger-captured change journal and inverse replay
//! - [`reorg`] — chain reorganization audit log
//!
//! Every operation takes `&mut SqliteConnection` and never commits; the
//! caller owns the transaction.

pub mod checkpoint;
pub mod db;
pub mod filter;
pub mod journal;
pub mod reorg;
pub mod schema;
pub mod sql;

pub use checkpoint::Checkpoint;
pub use db::{commit, StateDb};
pub use filter::FilterVersion;
pub use journal::{JournalEntry, JournalOp, JournaledTable};
pub use schema::CURRENT_SCHEMA_VERSION;
pub use sql::SqlValue;
