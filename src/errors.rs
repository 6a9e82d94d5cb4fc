//! Error types for the settlement engine.

use thiserror::Error;

/// Root error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input rejected before any mutation (stake bounds, unknown side, bad ids).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Conditional debit failed; no mutation occurred.
    #[error("Insufficient funds: balance {balance}, needed {needed}")]
    InsufficientFunds { balance: u64, needed: u64 },

    /// Per-account serialization could not be acquired cleanly.
    /// Safe to retry with the same inputs while nothing has committed.
    #[error("Ledger conflict on account {0}")]
    LedgerConflict(u64),

    /// Durable storage failed. A round is never disclosed without its
    /// audit record committed, so callers see this instead of a result.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// External payment reversal failed for one deposit.
    #[error("Reversal failed for charge {charge_id}: {reason}")]
    Reversal { charge_id: String, reason: String },

    /// Startup configuration rejected.
    #[error("Invalid configuration for {field}: '{value}' ({reason})")]
    Configuration {
        field: String,
        value: String,
        reason: String,
    },
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(format!("record encoding: {}", e))
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
