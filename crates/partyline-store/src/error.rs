//! Error types for the transactional store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for transactional store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The configured backend has no transaction support. Callers must not
    /// retry; a non-transactional backend cannot serialize lock admits.
    #[error("transactions are not supported by this store")]
    TxnUnsupported,

    /// The transaction lost a race with a concurrent commit.
    #[error("transaction conflict on key '{key}'")]
    TxnConflict {
        /// The key whose version check failed at commit.
        key: String,
    },

    /// Backend-level failure (connectivity, encoding, internal state).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns true when a fresh transaction may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TxnConflict { .. } | StoreError::Backend(_)
        )
    }
}
