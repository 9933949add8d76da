//! chainstate-sink — lifecycle orchestrator and stream driver for ChainState.
//!
//! [`StateSink`] implements the [`Lifecycle`] stages on top of the SQLite
//! state store; [`run`] feeds any [`StreamSource`] through them.

pub mod builder;
pub mod driver;
pub mod lifecycle;
pub mod orchestrator;

pub use builder::StateConfigBuilder;
pub use driver::{run, MessageStream, RunSummary, StreamSource};
pub use lifecycle::{BlockContext, BlockHandler, Lifecycle};
pub use orchestrator::StateSink;
