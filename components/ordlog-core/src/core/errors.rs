use thiserror::Error;

use crate::provider::ProviderError;

/// Failure taxonomy of an ingestion cycle. Fatal members terminate the
/// process after diagnostics are flushed; the rest are handled by the
/// service loop and retried on the next cycle with fresh input.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("stream corruption: {0}")]
    StreamCorruption(String),
    #[error("inscription numbering gap at block #{height}: expected {expected}, found {found}")]
    NumberingGap {
        height: u64,
        expected: i64,
        found: i64,
    },
    #[error("backfill failed for block #{height}: {reason}")]
    BackfillFailure { height: u64, reason: String },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("version mismatch: {0}")]
    VersionMismatch(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl IndexerError {
    /// Fatal conditions require operator intervention: the process must exit
    /// non-zero rather than continue with unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexerError::StreamCorruption(_)
                | IndexerError::InvariantViolation(_)
                | IndexerError::VersionMismatch(_)
        )
    }
}
