//! Provably fair three-outcome coin toss settlement engine.
//!
//! A round commits to a secret server seed, derives the toss from an
//! HMAC-SHA256 over the client seed and a per-account nonce, settles the
//! stake and payout against a durable per-account ledger in one atomic
//! batch, and discloses everything needed to re-verify the round.
//! Withdrawals are reconciled against prior external deposits by reversing
//! them oldest first.

pub mod config;
pub mod engine;
pub mod errors;
pub mod fairness;
pub mod ledger;
pub mod reconciler;
pub mod rounds;
pub mod store;
pub mod types;

pub use config::{ConfigLoader, EngineConfig};
pub use engine::SettlementEngine;
pub use errors::{EngineError, EngineResult};
pub use ledger::Ledger;
pub use reconciler::{Reconciler, ReversalError, ReversalGateway};
pub use store::LedgerStore;
pub use types::{
    AccountId, Deposit, ReversalFailure, RoundRecord, RoundResult, Side, WithdrawalOutcome,
    WithdrawalRequest, WithdrawalStatus,
};
