//! chainstate-core — domain types for the reorg-consistent indexing state engine.
//!
//! # Architecture
//!
//! ```text
//! StreamSource → run() → StateSink (Lifecycle)
//!                            ├── Schema gate      (versioned migrations)
//!                            ├── Change journal   (temp triggers, reverse replay)
//!                            ├── Checkpoint store (resume position)
//!                            ├── Filter versions  (factory-mode subscriptions)
//!                            └── Reorg log        (old head → new head)
//! ```
//!
//! This crate holds the storage-independent pieces: cursors, finality,
//! configuration, errors and the reorg detection rule.

pub mod config;
pub mod cursor;
pub mod error;
pub mod reorg;
pub mod types;

pub use config::{IdColumns, MigrateOptions, SinkState, StateConfig};
pub use cursor::Cursor;
pub use error::{StateError, StateResult};
pub use reorg::{detect_reorg, ReorgRecord};
pub use types::{Block, Finality, StreamMessage, StreamRequest};
