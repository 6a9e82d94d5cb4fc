//! Deposit and withdrawal reconciliation.
//!
//! Withdrawals are satisfied by reversing prior external-payment deposits,
//! oldest first, through the payment provider's reversal API. Each deposit
//! is attempted independently; a failure on one never aborts the rest of
//! the walk. Whatever cannot be auto-reversed is escalated as a pending
//! withdrawal request for manual operator fulfillment.

use crate::errors::{EngineError, EngineResult};
use crate::ledger::{BatchItems, Ledger};
use crate::store::LedgerStore;
use crate::types::{
    AccountId, Deposit, ReversalFailure, WithdrawalOutcome, WithdrawalRequest, WithdrawalStatus,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const DEPOSIT_PREFIX: &str = "deposit:id:";
const WITHDRAWAL_PREFIX: &[u8] = b"withdrawal:id:";

const DEPOSIT_PAGE: usize = 64;

fn deposit_key(charge_id: &str) -> Vec<u8> {
    format!("{}{}", DEPOSIT_PREFIX, charge_id).into_bytes()
}

fn deposit_index_prefix(account: AccountId) -> Vec<u8> {
    format!("deposit:index:{}:", account).into_bytes()
}

/// Oldest-first sort key: creation time, then charge id as a tiebreaker.
fn deposit_index_key(account: AccountId, created_at: i64, charge_id: &str) -> Vec<u8> {
    let mut key = deposit_index_prefix(account);
    key.extend_from_slice(&(created_at as u64).to_be_bytes());
    key.push(b':');
    key.extend_from_slice(charge_id.as_bytes());
    key
}

/// Inverted id as the sort key, so the newest request scans first and the
/// id counter can be recovered from a single-row scan.
fn withdrawal_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(WITHDRAWAL_PREFIX.len() + 8);
    key.extend_from_slice(WITHDRAWAL_PREFIX);
    key.extend_from_slice(&(u64::MAX - id).to_be_bytes());
    key
}

/// Outcome of one external reversal attempt.
#[derive(Debug, Clone)]
pub enum ReversalError {
    /// The provider refuses partial reversal for this charge.
    PartialUnsupported(String),
    /// The attempt failed outright (declined, timed out).
    Failed(String),
}

/// External payment reversal API.
#[async_trait]
pub trait ReversalGateway: Send + Sync {
    async fn reverse(&self, charge_id: &str, amount: u64) -> Result<(), ReversalError>;
}

pub struct Reconciler {
    ledger: Arc<Ledger>,
    store: Arc<LedgerStore>,
    gateway: Arc<dyn ReversalGateway>,
    // Serializes whole reconciliation walks per account; individual balance
    // mutations are additionally serialized inside the ledger.
    account_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    withdrawal_counter: AtomicU64,
}

impl Reconciler {
    pub fn new(
        store: Arc<LedgerStore>,
        ledger: Arc<Ledger>,
        gateway: Arc<dyn ReversalGateway>,
    ) -> EngineResult<Self> {
        let next_id = Self::recover_next_withdrawal_id(&store)?;
        Ok(Self {
            ledger,
            store,
            gateway,
            account_locks: DashMap::new(),
            withdrawal_counter: AtomicU64::new(next_id),
        })
    }

    fn recover_next_withdrawal_id(store: &LedgerStore) -> EngineResult<u64> {
        let rows = store.scan_prefix(WITHDRAWAL_PREFIX, None, 1);
        let Some((key, _)) = rows.first() else {
            return Ok(1);
        };
        let inv_bytes: [u8; 8] = key[WITHDRAWAL_PREFIX.len()..]
            .try_into()
            .map_err(|_| EngineError::Persistence("corrupt withdrawal key".to_string()))?;
        Ok(u64::MAX - u64::from_be_bytes(inv_bytes) + 1)
    }

    fn account_lock(&self, account: AccountId) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Record a cleared external payment and credit the account. The
    /// deposit row, its reversal-order index entry, and the balance credit
    /// commit in one batch. Returns the new balance.
    pub async fn confirm_deposit(
        &self,
        account: AccountId,
        charge_id: &str,
        amount: u64,
    ) -> EngineResult<u64> {
        if amount == 0 || charge_id.is_empty() {
            return Err(EngineError::Validation(
                "deposit requires a charge id and a positive amount".to_string(),
            ));
        }

        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        if self.store.get(&deposit_key(charge_id))?.is_some() {
            return Err(EngineError::Validation(format!(
                "charge {} already confirmed",
                charge_id
            )));
        }

        let deposit = Deposit {
            charge_id: charge_id.to_string(),
            account,
            amount,
            reversed: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        let items: BatchItems = vec![
            (deposit_key(charge_id), serde_json::to_vec(&deposit)?),
            (
                deposit_index_key(account, deposit.created_at, charge_id),
                charge_id.as_bytes().to_vec(),
            ),
        ];
        let balance = self.ledger.adjust(account, amount as i64, items)?;

        tracing::info!(account, charge_id, amount, balance, "deposit confirmed");
        Ok(balance)
    }

    /// Satisfy a withdrawal by reversing the account's deposits oldest
    /// first. The balance is decremented only by what was actually
    /// reversed; any shortfall becomes a pending request for manual
    /// fulfillment, left on the balance until an operator completes it.
    pub async fn request_withdrawal(
        &self,
        account: AccountId,
        amount: u64,
    ) -> EngineResult<WithdrawalOutcome> {
        if amount == 0 {
            return Err(EngineError::Validation(
                "withdrawal amount must be positive".to_string(),
            ));
        }

        let lock = self.account_lock(account);
        let _guard = lock.lock().await;

        let balance = self.ledger.balance(account)?;
        if amount > balance {
            return Err(EngineError::InsufficientFunds {
                balance,
                needed: amount,
            });
        }

        let mut remaining = amount;
        let mut auto_reversed = 0u64;
        let mut failures = Vec::new();

        for deposit in self.account_deposits(account)? {
            if remaining == 0 {
                break;
            }
            if deposit.unreversed() == 0 {
                continue;
            }

            let chunk = deposit.unreversed().min(remaining);

            // Reserve the chunk before touching the external API: the
            // debit and the incremented reversed amount commit as one
            // batch, so the gateway call always follows a committed
            // reservation and a crash or failure can never leave an
            // executed refund unaccounted for.
            let mut reserved = deposit.clone();
            reserved.reversed += chunk;
            let items: BatchItems = vec![(
                deposit_key(&deposit.charge_id),
                serde_json::to_vec(&reserved)?,
            )];
            if !self.ledger.try_debit_with(account, chunk, items)? {
                // A concurrent settlement drained the balance under the
                // up-front check; the rest of the request becomes the
                // shortfall.
                tracing::warn!(
                    account,
                    charge_id = %deposit.charge_id,
                    chunk,
                    "balance no longer covers reversal chunk, stopping walk"
                );
                break;
            }

            match self.gateway.reverse(&deposit.charge_id, chunk).await {
                Ok(()) => {
                    auto_reversed += chunk;
                    remaining -= chunk;
                    tracing::debug!(
                        account,
                        charge_id = %deposit.charge_id,
                        chunk,
                        "deposit reversed"
                    );
                }
                Err(gateway_error) => {
                    // Refund the reservation and restore the deposit row,
                    // then continue; one bad deposit never aborts the walk.
                    let items: BatchItems = vec![(
                        deposit_key(&deposit.charge_id),
                        serde_json::to_vec(&deposit)?,
                    )];
                    self.ledger.adjust(account, chunk as i64, items)?;

                    let reason = match gateway_error {
                        // A full-amount retry would only be allowed for a
                        // fully unreversed deposit the remaining request
                        // covers, and in that case the attempted chunk
                        // already was the full amount. Nothing different
                        // to retry.
                        ReversalError::PartialUnsupported(r) => {
                            format!("partial reversal unsupported: {}", r)
                        }
                        ReversalError::Failed(r) => r,
                    };
                    let error = EngineError::Reversal {
                        charge_id: deposit.charge_id.clone(),
                        reason: reason.clone(),
                    };
                    tracing::warn!(account, chunk, %error, "skipping deposit");
                    failures.push(ReversalFailure {
                        charge_id: deposit.charge_id.clone(),
                        reason,
                    });
                }
            }
        }

        let pending = if remaining > 0 {
            let request = WithdrawalRequest {
                id: self.withdrawal_counter.fetch_add(1, Ordering::SeqCst),
                account,
                requested: amount,
                auto_reversed,
                status: WithdrawalStatus::Pending,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            self.store
                .put(&withdrawal_key(request.id), &serde_json::to_vec(&request)?)?;
            tracing::info!(
                account,
                request_id = request.id,
                shortfall = request.shortfall(),
                "withdrawal shortfall escalated to manual review"
            );
            Some(request)
        } else {
            None
        };

        tracing::info!(account, amount, auto_reversed, "withdrawal processed");
        Ok(WithdrawalOutcome {
            auto_reversed,
            pending,
            failures,
        })
    }

    /// Operator action: complete a pending request, debiting the shortfall
    /// and marking the request fulfilled in one batch.
    pub async fn fulfill_withdrawal(&self, id: u64) -> EngineResult<WithdrawalRequest> {
        let mut request = self
            .withdrawal(id)?
            .ok_or_else(|| EngineError::Validation(format!("withdrawal {} not found", id)))?;
        if request.status == WithdrawalStatus::Fulfilled {
            return Err(EngineError::Validation(format!(
                "withdrawal {} already fulfilled",
                id
            )));
        }

        let lock = self.account_lock(request.account);
        let _guard = lock.lock().await;

        let shortfall = request.shortfall();
        request.status = WithdrawalStatus::Fulfilled;
        let items: BatchItems = vec![(withdrawal_key(id), serde_json::to_vec(&request)?)];
        self.ledger
            .adjust(request.account, -(shortfall as i64), items)?;

        tracing::info!(
            request_id = id,
            account = request.account,
            shortfall,
            "withdrawal fulfilled by operator"
        );
        Ok(request)
    }

    pub fn deposit(&self, charge_id: &str) -> EngineResult<Option<Deposit>> {
        match self.store.get(&deposit_key(charge_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// An account's deposits, oldest first.
    pub fn account_deposits(&self, account: AccountId) -> EngineResult<Vec<Deposit>> {
        let prefix = deposit_index_prefix(account);
        let mut deposits = Vec::new();
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let rows = self
                .store
                .scan_prefix(&prefix, cursor.as_deref(), DEPOSIT_PAGE);
            if rows.is_empty() {
                break;
            }
            for (key, charge_id) in &rows {
                let charge_id = String::from_utf8(charge_id.clone())
                    .map_err(|_| EngineError::Persistence("corrupt deposit index".to_string()))?;
                if let Some(deposit) = self.deposit(&charge_id)? {
                    deposits.push(deposit);
                }
                cursor = Some(key.clone());
            }
            if rows.len() < DEPOSIT_PAGE {
                break;
            }
        }

        Ok(deposits)
    }

    pub fn withdrawal(&self, id: u64) -> EngineResult<Option<WithdrawalRequest>> {
        match self.store.get(&withdrawal_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All requests still awaiting manual fulfillment, newest first.
    pub fn pending_withdrawals(&self) -> EngineResult<Vec<WithdrawalRequest>> {
        let mut pending = Vec::new();
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let rows = self
                .store
                .scan_prefix(WITHDRAWAL_PREFIX, cursor.as_deref(), DEPOSIT_PAGE);
            if rows.is_empty() {
                break;
            }
            for (key, bytes) in &rows {
                let request: WithdrawalRequest = serde_json::from_slice(bytes)?;
                if request.status == WithdrawalStatus::Pending {
                    pending.push(request);
                }
                cursor = Some(key.clone());
            }
            if rows.len() < DEPOSIT_PAGE {
                break;
            }
        }

        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct ScriptedGateway {
        refuse: std::sync::Mutex<HashMap<String, ReversalError>>,
        calls: std::sync::Mutex<Vec<(String, u64)>>,
    }

    impl ScriptedGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refuse: std::sync::Mutex::new(HashMap::new()),
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn refuse_charge(&self, charge_id: &str, error: ReversalError) {
            self.refuse
                .lock()
                .unwrap()
                .insert(charge_id.to_string(), error);
        }

        fn calls(&self) -> Vec<(String, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReversalGateway for ScriptedGateway {
        async fn reverse(&self, charge_id: &str, amount: u64) -> Result<(), ReversalError> {
            self.calls
                .lock()
                .unwrap()
                .push((charge_id.to_string(), amount));
            match self.refuse.lock().unwrap().get(charge_id) {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    fn open_reconciler(gateway: Arc<ScriptedGateway>) -> (Reconciler, Arc<Ledger>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let reconciler = Reconciler::new(store, ledger.clone(), gateway).unwrap();
        (reconciler, ledger, dir)
    }

    #[tokio::test]
    async fn test_confirm_deposit_credits_and_rejects_duplicates() {
        let gateway = ScriptedGateway::new();
        let (reconciler, ledger, _dir) = open_reconciler(gateway);

        let balance = reconciler.confirm_deposit(1, "ch_1", 600).await.unwrap();
        assert_eq!(balance, 600);
        assert_eq!(ledger.balance(1).unwrap(), 600);

        assert!(matches!(
            reconciler.confirm_deposit(1, "ch_1", 600).await,
            Err(EngineError::Validation(_))
        ));
        assert_eq!(ledger.balance(1).unwrap(), 600);
    }

    #[tokio::test]
    async fn test_withdrawal_reverses_deposits_oldest_first() {
        let gateway = ScriptedGateway::new();
        let (reconciler, ledger, _dir) = open_reconciler(gateway.clone());

        reconciler.confirm_deposit(1, "ch_a", 600).await.unwrap();
        reconciler.confirm_deposit(1, "ch_b", 400).await.unwrap();

        let outcome = reconciler.request_withdrawal(1, 700).await.unwrap();
        assert_eq!(outcome.auto_reversed, 700);
        assert!(outcome.pending.is_none());
        assert_eq!(ledger.balance(1).unwrap(), 300);

        assert_eq!(
            gateway.calls(),
            vec![("ch_a".to_string(), 600), ("ch_b".to_string(), 100)]
        );
        assert_eq!(reconciler.deposit("ch_a").unwrap().unwrap().reversed, 600);
        assert_eq!(reconciler.deposit("ch_b").unwrap().unwrap().reversed, 100);
    }

    #[tokio::test]
    async fn test_shortfall_escalates_without_debiting_remainder() {
        let gateway = ScriptedGateway::new();
        let (reconciler, ledger, _dir) = open_reconciler(gateway);

        reconciler.confirm_deposit(2, "ch_a", 600).await.unwrap();
        reconciler.confirm_deposit(2, "ch_b", 400).await.unwrap();
        ledger.credit(2, 500).unwrap();
        assert_eq!(ledger.balance(2).unwrap(), 1500);

        let outcome = reconciler.request_withdrawal(2, 1500).await.unwrap();
        assert_eq!(outcome.auto_reversed, 1000);

        let pending = outcome.pending.unwrap();
        assert_eq!(pending.status, WithdrawalStatus::Pending);
        assert_eq!(pending.requested, 1500);
        assert_eq!(pending.shortfall(), 500);

        // Only the auto-reversed portion leaves the balance.
        assert_eq!(ledger.balance(2).unwrap(), 500);
        assert_eq!(reconciler.pending_withdrawals().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_withdrawal_above_balance() {
        let gateway = ScriptedGateway::new();
        let (reconciler, _ledger, _dir) = open_reconciler(gateway.clone());

        reconciler.confirm_deposit(3, "ch_a", 600).await.unwrap();

        assert!(matches!(
            reconciler.request_withdrawal(3, 601).await,
            Err(EngineError::InsufficientFunds { .. })
        ));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reversal_does_not_abort_the_walk() {
        let gateway = ScriptedGateway::new();
        gateway.refuse_charge("ch_a", ReversalError::Failed("declined".to_string()));
        let (reconciler, ledger, _dir) = open_reconciler(gateway.clone());

        reconciler.confirm_deposit(4, "ch_a", 600).await.unwrap();
        reconciler.confirm_deposit(4, "ch_b", 400).await.unwrap();

        let outcome = reconciler.request_withdrawal(4, 700).await.unwrap();
        assert_eq!(outcome.auto_reversed, 400);
        assert_eq!(outcome.pending.unwrap().shortfall(), 300);
        assert_eq!(ledger.balance(4).unwrap(), 600);

        // Both deposits were attempted despite the first failing, and the
        // failed one is reported with its reservation refunded.
        assert_eq!(gateway.calls().len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].charge_id, "ch_a");
        assert_eq!(reconciler.deposit("ch_a").unwrap().unwrap().reversed, 0);
        assert_eq!(reconciler.deposit("ch_b").unwrap().unwrap().reversed, 400);
    }

    #[tokio::test]
    async fn test_partial_unsupported_skips_the_deposit() {
        let gateway = ScriptedGateway::new();
        gateway.refuse_charge(
            "ch_a",
            ReversalError::PartialUnsupported("full only".to_string()),
        );
        let (reconciler, ledger, _dir) = open_reconciler(gateway.clone());

        reconciler.confirm_deposit(5, "ch_a", 600).await.unwrap();
        reconciler.confirm_deposit(5, "ch_b", 400).await.unwrap();

        let outcome = reconciler.request_withdrawal(5, 500).await.unwrap();
        assert_eq!(outcome.auto_reversed, 400);
        assert_eq!(outcome.pending.unwrap().shortfall(), 100);
        assert_eq!(ledger.balance(5).unwrap(), 600);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("partial reversal unsupported"));
        assert_eq!(reconciler.deposit("ch_a").unwrap().unwrap().reversed, 0);
    }

    // Empties the account inside the reversal call, like a settlement
    // racing the withdrawal walk.
    struct DrainingGateway {
        ledger: Arc<Ledger>,
        account: AccountId,
        calls: std::sync::Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl ReversalGateway for DrainingGateway {
        async fn reverse(&self, charge_id: &str, amount: u64) -> Result<(), ReversalError> {
            self.calls
                .lock()
                .unwrap()
                .push((charge_id.to_string(), amount));
            let balance = self.ledger.balance(self.account).unwrap();
            if balance > 0 {
                assert!(self.ledger.try_debit(self.account, balance).unwrap());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_drain_cannot_double_reverse() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let gateway = Arc::new(DrainingGateway {
            ledger: ledger.clone(),
            account: 8,
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let reconciler = Reconciler::new(store, ledger.clone(), gateway.clone()).unwrap();

        reconciler.confirm_deposit(8, "ch_a", 600).await.unwrap();
        reconciler.confirm_deposit(8, "ch_b", 400).await.unwrap();

        let outcome = reconciler.request_withdrawal(8, 700).await.unwrap();

        // The first chunk was reserved before the drain, so its reversal
        // stands; the second found no balance left and never reached the
        // gateway. Nothing can be reversed twice.
        assert_eq!(outcome.auto_reversed, 600);
        assert_eq!(outcome.pending.unwrap().shortfall(), 100);
        assert_eq!(
            gateway.calls.lock().unwrap().clone(),
            vec![("ch_a".to_string(), 600)]
        );
        assert_eq!(reconciler.deposit("ch_a").unwrap().unwrap().reversed, 600);
        assert_eq!(reconciler.deposit("ch_b").unwrap().unwrap().reversed, 0);
        assert_eq!(ledger.balance(8).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fulfill_withdrawal_debits_shortfall_once() {
        let gateway = ScriptedGateway::new();
        gateway.refuse_charge("ch_a", ReversalError::Failed("timeout".to_string()));
        let (reconciler, ledger, _dir) = open_reconciler(gateway);

        reconciler.confirm_deposit(6, "ch_a", 1000).await.unwrap();
        let outcome = reconciler.request_withdrawal(6, 700).await.unwrap();
        let pending = outcome.pending.unwrap();
        assert_eq!(pending.shortfall(), 700);
        assert_eq!(ledger.balance(6).unwrap(), 1000);

        let fulfilled = reconciler.fulfill_withdrawal(pending.id).await.unwrap();
        assert_eq!(fulfilled.status, WithdrawalStatus::Fulfilled);
        assert_eq!(ledger.balance(6).unwrap(), 300);
        assert!(reconciler.pending_withdrawals().unwrap().is_empty());

        assert!(matches!(
            reconciler.fulfill_withdrawal(pending.id).await,
            Err(EngineError::Validation(_))
        ));
        assert_eq!(ledger.balance(6).unwrap(), 300);
    }
}
