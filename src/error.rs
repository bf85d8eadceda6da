//! Structured error taxonomy for the settlement engine.
//!
//! Expected, recoverable conditions (already resolved, locked, modifier
//! conflicts) are values callers branch on, never panics. Upstream
//! failures are caught per-round inside verification batches.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller lacks the required capability. Hard reject, never retried.
    #[error("not authorized")]
    Unauthorized,

    /// Unknown round, question, bet, or user record.
    #[error("{0} not found")]
    NotFound(String),

    /// The operation is valid but the record is in the wrong state
    /// (round locked, both modifiers set, stake after lock, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Evidence search or answer extraction failed or timed out.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidState(reason.into())
    }

    pub fn upstream(reason: impl Into<String>) -> Self {
        EngineError::Upstream(reason.into())
    }
}
