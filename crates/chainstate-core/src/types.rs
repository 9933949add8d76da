//! Shared types for the block-processing pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;

// ─── Finality ─────────────────────────────────────────────────────────────────

/// Durability level the stream asserts for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finality {
    /// Provisional; superseded by the next delivery at the same or a later position.
    Pending,
    /// Stable, but still reversible by a reorg.
    Accepted,
    /// Irreversible.
    Finalized,
}

impl Finality {
    /// Writes for blocks at this level must be journaled.
    pub fn is_reversible(self) -> bool {
        !matches!(self, Self::Finalized)
    }

    /// Blocks at this level advance the checkpoint.
    pub fn advances_checkpoint(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Finality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block delivered by the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block<D> {
    /// Position the stream was at before this block (`None` at stream start).
    pub cursor: Option<Cursor>,
    /// Position of this block.
    pub end_cursor: Cursor,
    /// Stream-asserted finality.
    pub finality: Finality,
    /// Decoded payload.
    pub data: D,
}

impl<D> Block<D> {
    pub fn new(cursor: Option<Cursor>, end_cursor: Cursor, finality: Finality, data: D) -> Self {
        Self {
            cursor,
            end_cursor,
            finality,
            data,
        }
    }

    /// Block number of this block.
    pub fn number(&self) -> u64 {
        self.end_cursor.order_key
    }
}

// ─── Stream request / messages ────────────────────────────────────────────────

/// What the stream layer subscribes with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRequest<F> {
    /// Resume strictly after this position (`None` = from the beginning).
    pub starting_cursor: Option<Cursor>,
    /// Subscription filter.
    pub filter: Option<F>,
}

impl<F> StreamRequest<F> {
    pub fn new(filter: F) -> Self {
        Self {
            starting_cursor: None,
            filter: Some(filter),
        }
    }

    /// Set the starting cursor.
    pub fn starting_at(mut self, cursor: Cursor) -> Self {
        self.starting_cursor = Some(cursor);
        self
    }
}

/// A message delivered by the stream.
#[derive(Debug, Clone)]
pub enum StreamMessage<D> {
    /// A new block.
    Data(Block<D>),
    /// Everything at or before this cursor is irreversible.
    Finalize(Cursor),
    /// Everything after this cursor is invalid.
    Invalidate(Cursor),
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finality_rules() {
        assert!(Finality::Pending.is_reversible());
        assert!(Finality::Accepted.is_reversible());
        assert!(!Finality::Finalized.is_reversible());

        assert!(!Finality::Pending.advances_checkpoint());
        assert!(Finality::Accepted.advances_checkpoint());
        assert!(Finality::Finalized.advances_checkpoint());
    }

    #[test]
    fn finality_serde_lowercase() {
        let json = serde_json::to_string(&Finality::Accepted).unwrap();
        assert_eq!(json, "\"accepted\"");
        let back: Finality = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(back, Finality::Pending);
    }

    #[test]
    fn request_builder() {
        let req = StreamRequest::new(vec!["0xfactory".to_string()]).starting_at(Cursor::new(42));
        assert_eq!(req.starting_cursor.unwrap().order_key, 42);
        assert_eq!(req.filter.unwrap().len(), 1);
    }
}
