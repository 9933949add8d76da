//! The stream driver — feeds a block stream through a [`Lifecycle`].
//!
//! ```text
//! before_run
//! loop:
//!   before_connect → connect → after_connect
//!   for each message: around_block | on_finalize | on_invalidate
//!   a committed block derived a filter → reconnect after it with the new filter
//!   stream ended → done
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::info;

use chainstate_core::error::{StateError, StateResult};
use chainstate_core::types::{StreamMessage, StreamRequest};

use crate::lifecycle::{BlockHandler, Lifecycle};

/// Block stream produced by a [`StreamSource`].
pub type MessageStream<D> = BoxStream<'static, anyhow::Result<StreamMessage<D>>>;

/// The network side: anything that can open a cursor-ordered block stream.
#[async_trait]
pub trait StreamSource<D: Send + 'static, F: Send + 'static>: Send {
    /// Open a stream starting strictly after `request.starting_cursor`.
    async fn connect(&mut self, request: StreamRequest<F>) -> anyhow::Result<MessageStream<D>>;
}

/// Counters returned by [`run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Blocks committed (all finalities).
    pub blocks: u64,
    pub finalized: u64,
    pub invalidated: u64,
    /// Reconnects caused by derived filters.
    pub reconnects: u64,
}

/// Drive `source` through `lifecycle` until the stream ends.
///
/// Messages are processed strictly in order. A failing stage stops the run
/// with that stage's error; nothing is retried here.
pub async fn run<D, F, L, S, H>(
    lifecycle: &mut L,
    source: &mut S,
    handler: &H,
    mut request: StreamRequest<F>,
) -> StateResult<RunSummary>
where
    D: Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    L: Lifecycle<F>,
    S: StreamSource<D, F> + ?Sized,
    H: BlockHandler<D, F>,
{
    lifecycle.before_run().await?;
    let mut summary = RunSummary::default();

    loop {
        let connect_request = lifecycle.before_connect(request.clone()).await?;
        let mut stream = source
            .connect(connect_request.clone())
            .await
            .map_err(StateError::Stream)?;
        lifecycle.after_connect(&connect_request).await?;

        let mut reconnect = None;
        while let Some(message) = stream.next().await {
            match message.map_err(StateError::Stream)? {
                StreamMessage::Data(block) => {
                    let derived = lifecycle.around_block(&block, handler).await?;
                    summary.blocks += 1;
                    if let Some(filter) = derived {
                        reconnect = Some(StreamRequest {
                            starting_cursor: Some(block.end_cursor.clone()),
                            filter: Some(filter),
                        });
                        break;
                    }
                }
                StreamMessage::Finalize(cursor) => {
                    lifecycle.on_finalize(&cursor).await?;
                    summary.finalized += 1;
                }
                StreamMessage::Invalidate(cursor) => {
                    lifecycle.on_invalidate(&cursor).await?;
                    summary.invalidated += 1;
                }
            }
        }

        match reconnect {
            Some(next) => {
                summary.reconnects += 1;
                info!(cursor = ?next.starting_cursor, "filter changed, reconnecting");
                request = next;
            }
            None => {
                info!(
                    blocks = summary.blocks,
                    finalized = summary.finalized,
                    invalidated = summary.invalidated,
                    reconnects = summary.reconnects,
                    "stream ended"
                );
                return Ok(summary);
            }
        }
    }
}
