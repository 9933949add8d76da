//! Stream cursor — an ordered position in the block stream.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// A position in the block stream.
///
/// The cursor knows:
/// - The `order_key` (block number, monotonic) used for all ordering
/// - An optional `unique_key` (block hash) telling competing blocks at the
///   same height apart
///
/// `unique_key = None` means "position known, fingerprint cleared". Stores
/// overwrite with it, never merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Monotonic position (block number).
    pub order_key: u64,
    /// Opaque fingerprint (`0x…` hash), not ordered.
    pub unique_key: Option<String>,
}

impl Cursor {
    /// Create a cursor at `order_key` with no fingerprint.
    pub fn new(order_key: u64) -> Self {
        Self {
            order_key,
            unique_key: None,
        }
    }

    /// Create a cursor with a fingerprint.
    pub fn with_unique_key(order_key: u64, unique_key: impl Into<String>) -> Self {
        Self {
            order_key,
            unique_key: Some(unique_key.into()),
        }
    }

    /// Returns `true` if this cursor is strictly after `other`.
    pub fn is_after(&self, other: &Cursor) -> bool {
        self.order_key > other.order_key
    }

    /// Compare positions only; `unique_key` never takes part in ordering.
    pub fn cmp_position(&self, other: &Cursor) -> Ordering {
        self.order_key.cmp(&other.order_key)
    }

    /// The lower of two cursors by position. Ties keep `self`.
    pub fn min_position<'a>(&'a self, other: &'a Cursor) -> &'a Cursor {
        if other.order_key < self.order_key {
            other
        } else {
            self
        }
    }

    /// Order key as stored in SQLite (`INTEGER` is a signed 64-bit value).
    ///
    /// Order keys above `i64::MAX` cannot be stored or compared and are
    /// rejected as a configuration error.
    pub fn order_key_i64(&self) -> Result<i64, StateError> {
        i64::try_from(self.order_key).map_err(|_| {
            StateError::Config(format!(
                "order key {} exceeds the storable maximum {}",
                self.order_key,
                i64::MAX
            ))
        })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unique_key {
            Some(key) => write!(f, "{}/{}", self.order_key, key),
            None => write!(f, "{}", self.order_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_ignores_unique_key() {
        let a = Cursor::with_unique_key(100, "0xaaa");
        let b = Cursor::with_unique_key(100, "0xbbb");
        assert_eq!(a.cmp_position(&b), Ordering::Equal);
        assert!(!a.is_after(&b));
        assert!(Cursor::new(101).is_after(&a));
    }

    #[test]
    fn min_position_prefers_lower() {
        let low = Cursor::new(5);
        let high = Cursor::with_unique_key(9, "0x9");
        assert_eq!(high.min_position(&low), &low);
        assert_eq!(low.min_position(&high), &low);
    }

    #[test]
    fn order_key_beyond_i64_is_rejected() {
        assert_eq!(Cursor::new(i64::MAX as u64).order_key_i64().unwrap(), i64::MAX);
        assert!(matches!(
            Cursor::new(u64::MAX).order_key_i64(),
            Err(StateError::Config(_))
        ));
    }

    #[test]
    fn display_includes_fingerprint() {
        assert_eq!(Cursor::new(7).to_string(), "7");
        assert_eq!(Cursor::with_unique_key(7, "0xabc").to_string(), "7/0xabc");
    }
}
