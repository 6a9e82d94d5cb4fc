//! Settlement orchestration.
//!
//! One round walks Requested -> Reserved -> Resolved -> Disclosed: inputs
//! are validated, the stake is reserved against the balance, seeds are
//! generated and the outcome derived, and the payout credit lands in the
//! same durable batch as the debit and the audit record. The caller gets
//! the full settlement back, server seed included, for disclosure.

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::fairness::{self, OutcomeTable, PayoutTable};
use crate::ledger::Ledger;
use crate::rounds;
use crate::store::LedgerStore;
use crate::types::{AccountId, RoundRecord, RoundResult, Side};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Attempts per round before a ledger conflict is surfaced. Nothing has
/// committed when a conflict is reported, so retrying the same inputs is
/// safe.
const MAX_SETTLE_ATTEMPTS: u32 = 3;

pub struct SettlementEngine {
    ledger: Arc<Ledger>,
    store: Arc<LedgerStore>,
    outcomes: OutcomeTable,
    payouts: PayoutTable,
    min_bet: u64,
    max_bet: u64,
    house_account: AccountId,
    round_counter: AtomicU64,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<LedgerStore>,
        ledger: Arc<Ledger>,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let outcomes = OutcomeTable::new(&config.odds)?;
        let payouts = PayoutTable::new(&config.payouts);
        let next_round_id = rounds::recover_next_round_id(&store)?;

        Ok(Self {
            ledger,
            store,
            outcomes,
            payouts,
            min_bet: config.betting.min_bet,
            max_bet: config.betting.max_bet,
            house_account: config.betting.house_account,
            round_counter: AtomicU64::new(next_round_id),
        })
    }

    /// Settle one wager and return the full disclosed round.
    pub fn submit_bet(
        &self,
        account: AccountId,
        side: Side,
        stake: u64,
    ) -> EngineResult<RoundResult> {
        if stake < self.min_bet || stake > self.max_bet {
            return Err(EngineError::Validation(format!(
                "stake {} outside [{}, {}]",
                stake, self.min_bet, self.max_bet
            )));
        }
        if account == self.house_account {
            return Err(EngineError::Validation(
                "house account cannot wager against itself".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            match self.settle_once(account, side, stake) {
                Err(EngineError::LedgerConflict(acct)) if attempt + 1 < MAX_SETTLE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(
                        account = acct,
                        attempt,
                        "ledger conflict during settlement, retrying"
                    );
                }
                other => return other,
            }
        }
    }

    fn settle_once(
        &self,
        account: AccountId,
        side: Side,
        stake: u64,
    ) -> EngineResult<RoundResult> {
        let (balance, record) = self.ledger.settle_round(account, stake, |nonce| {
            let server_seed = fairness::generate_seed();
            let client_seed = fairness::generate_seed();
            let commitment = fairness::commit(&server_seed);
            let (outcome, roll) =
                fairness::derive(&server_seed, &client_seed, nonce, &self.outcomes);
            let payout = fairness::payout(outcome, side, stake, &self.payouts);

            let record = RoundRecord {
                round_id: self.round_counter.fetch_add(1, Ordering::SeqCst),
                account,
                side,
                stake,
                server_seed,
                client_seed,
                nonce,
                commitment,
                outcome,
                roll,
                payout,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            let items = rounds::round_items(&record)?;
            Ok((payout, record, items))
        })?;

        tracing::debug!(
            round_id = record.round_id,
            account,
            stake,
            outcome = %record.outcome,
            payout = record.payout,
            "round settled"
        );

        Ok(RoundResult { record, balance })
    }

    /// Re-verify a stored round from its disclosed material.
    pub fn verify_round(&self, round_id: u64) -> EngineResult<bool> {
        let record = rounds::load_round(&self.store, round_id)?
            .ok_or_else(|| EngineError::Validation(format!("round {} not found", round_id)))?;
        Ok(fairness::verify_round(&record, &self.outcomes, &self.payouts))
    }

    /// Most recent rounds, newest first.
    pub fn recent_rounds(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> EngineResult<(Vec<RoundRecord>, Option<String>)> {
        let (ids, next_cursor) = rounds::load_recent_round_ids(&self.store, cursor, limit)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = rounds::load_round(&self.store, id)? {
                records.push(record);
            }
        }
        Ok((records, next_cursor))
    }

    pub fn balance(&self, account: AccountId) -> EngineResult<u64> {
        self.ledger.balance(account)
    }

    pub fn house_net(&self) -> EngineResult<i64> {
        self.ledger.house_net()
    }
}
