//! Error types for the chainstate engine.

use thiserror::Error;

/// Errors that can occur while keeping indexed state consistent.
///
/// Every variant is fatal to the current unit of work (block, signal or
/// startup). Only initialization is retried, and only for retryable causes.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("initialization failed after {attempts} attempt(s): {reason}")]
    Initialization { attempts: u32, reason: String },

    #[error("stored schema version {stored} is newer than supported version {supported}")]
    SchemaTooNew { stored: i64, supported: i64 },

    #[error("persistence error in '{op}' for indexer '{indexer_id}': {reason}")]
    Persistence {
        op: &'static str,
        indexer_id: String,
        reason: String,
    },

    #[error("invalidation to block {order_key} failed for indexer '{indexer_id}': {reason}")]
    Invalidation {
        indexer_id: String,
        order_key: u64,
        reason: String,
    },

    #[error("journal error in '{op}': {reason}")]
    Journal { op: &'static str, reason: String },

    #[error("handler failed at block {order_key}: {source}")]
    Consumer {
        order_key: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("stream error: {0}")]
    Stream(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for the chainstate engine.
pub type StateResult<T> = std::result::Result<T, StateError>;

impl StateError {
    pub fn persistence(op: &'static str, indexer_id: &str, reason: impl ToString) -> Self {
        Self::Persistence {
            op,
            indexer_id: indexer_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn journal(op: &'static str, reason: impl ToString) -> Self {
        Self::Journal {
            op,
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if retrying startup could succeed.
    ///
    /// A schema that is too new or a bad configuration will fail the same
    /// way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::SchemaTooNew { .. } | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StateError::persistence("set_checkpoint", "idx", "locked").is_retryable());
        assert!(!StateError::Config("no such table".into()).is_retryable());
        assert!(!StateError::SchemaTooNew {
            stored: 9,
            supported: 2
        }
        .is_retryable());
    }

    #[test]
    fn consumer_error_keeps_cause() {
        let err = StateError::Consumer {
            order_key: 12,
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "handler failed at block 12: boom");
        assert!(std::error::Error::source(&err).is_some());
    }
}
