//! Chain reorganization detection.
//!
//! An invalidation signal is a reorg when the indexer had already committed
//! past the rollback point. Pending supersedence and resume-time rollbacks
//! never move a committed head backwards, so they are not reorgs.

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;

/// One detected chain reorganization (old head → new head).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgRecord {
    /// Indexer identity that observed the reorg.
    pub indexer_id: String,
    /// Checkpoint before the rollback.
    pub old_head: Cursor,
    /// Rollback target.
    pub new_head: Cursor,
    /// Unix timestamp (seconds) of detection.
    pub recorded_at: i64,
}

impl ReorgRecord {
    /// Number of blocks rolled back.
    pub fn depth(&self) -> u64 {
        self.old_head.order_key.saturating_sub(self.new_head.order_key)
    }
}

/// Decide whether rolling back to `rollback` from `prior_checkpoint` is a reorg.
///
/// Returns `Some(ReorgRecord)` if the committed head was strictly ahead.
pub fn detect_reorg(
    indexer_id: &str,
    prior_checkpoint: Option<&Cursor>,
    rollback: &Cursor,
) -> Option<ReorgRecord> {
    let old_head = prior_checkpoint?;
    if !old_head.is_after(rollback) {
        return None;
    }
    let record = ReorgRecord {
        indexer_id: indexer_id.to_string(),
        old_head: old_head.clone(),
        new_head: rollback.clone(),
        recorded_at: chrono::Utc::now().timestamp(),
    };
    tracing::warn!(
        indexer_id,
        old_head = %record.old_head,
        new_head = %record.new_head,
        depth = record.depth(),
        "Chain reorganization detected"
    );
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reorg_without_checkpoint() {
        assert!(detect_reorg("idx", None, &Cursor::new(10)).is_none());
    }

    #[test]
    fn no_reorg_when_not_ahead() {
        let cp = Cursor::with_unique_key(10, "0xa");
        assert!(detect_reorg("idx", Some(&cp), &Cursor::new(10)).is_none());
        assert!(detect_reorg("idx", Some(&cp), &Cursor::new(12)).is_none());
    }

    #[test]
    fn detects_rollback_behind_head() {
        let cp = Cursor::with_unique_key(105, "0xold");
        let target = Cursor::with_unique_key(102, "0xnew");
        let record = detect_reorg("idx", Some(&cp), &target).unwrap();
        assert_eq!(record.old_head, cp);
        assert_eq!(record.new_head, target);
        assert_eq!(record.depth(), 3);
        assert_eq!(record.indexer_id, "idx");
    }
}
