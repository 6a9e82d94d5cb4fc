//! Durable per-account balance ledger.
//!
//! Every mutation of one account's balance happens with that account's lock
//! held, so concurrent callers can never both observe a stale "sufficient"
//! balance and overdraw it. Balance writes and any records that must land
//! with them (audit rows, deposit bookkeeping) commit in a single storage
//! batch.

use crate::errors::{EngineError, EngineResult};
use crate::store::LedgerStore;
use crate::types::AccountId;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

const HOUSE_NET_KEY: &[u8] = b"house:net";

pub(crate) fn balance_key(account: AccountId) -> Vec<u8> {
    format!("account:balance:{}", account).into_bytes()
}

fn nonce_key(account: AccountId) -> Vec<u8> {
    format!("account:nonce:{}", account).into_bytes()
}

fn decode_u64(bytes: &[u8]) -> EngineResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| EngineError::Persistence("corrupt u64 record".to_string()))?;
    Ok(u64::from_le_bytes(arr))
}

/// Extra `(key, value)` items committed atomically with a balance change.
pub type BatchItems = Vec<(Vec<u8>, Vec<u8>)>;

pub struct Ledger {
    store: Arc<LedgerStore>,
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
    house_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            house_lock: Mutex::new(()),
        }
    }

    fn lock_cell(&self, account: AccountId) -> Arc<Mutex<()>> {
        self.locks
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn stored_balance(&self, account: AccountId) -> EngineResult<u64> {
        match self.store.get(&balance_key(account))? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn stored_nonce(&self, account: AccountId) -> EngineResult<u64> {
        match self.store.get(&nonce_key(account))? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Current balance. Lazily materializes a zero-balance account on first
    /// read, as account rows are created on first reference.
    pub fn balance(&self, account: AccountId) -> EngineResult<u64> {
        let cell = self.lock_cell(account);
        let _guard = cell
            .lock()
            .map_err(|_| EngineError::LedgerConflict(account))?;

        let key = balance_key(account);
        // The zero row may only be written for a confirmed-absent key; a
        // read error must never look like a fresh account.
        match self.store.get(&key)? {
            Some(bytes) => decode_u64(&bytes),
            None => {
                self.store.put(&key, &0u64.to_le_bytes())?;
                Ok(0)
            }
        }
    }

    /// Conditionally subtract `amount` if the balance covers it. Returns
    /// `false` and leaves the balance untouched otherwise.
    pub fn try_debit(&self, account: AccountId, amount: u64) -> EngineResult<bool> {
        self.try_debit_with(account, amount, Vec::new())
    }

    /// Conditional debit that commits `extra` items in the same batch as
    /// the balance change. On `false` nothing is written, `extra` included.
    pub(crate) fn try_debit_with(
        &self,
        account: AccountId,
        amount: u64,
        extra: BatchItems,
    ) -> EngineResult<bool> {
        match self.adjust(account, -(amount as i64), extra) {
            Ok(_) => Ok(true),
            Err(EngineError::InsufficientFunds { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Unconditionally add `amount` (zero allowed).
    pub fn credit(&self, account: AccountId, amount: u64) -> EngineResult<u64> {
        self.adjust(account, amount as i64, Vec::new())
    }

    /// Apply a signed delta under the account lock, committing `extra`
    /// items in the same batch. Returns the new balance.
    pub(crate) fn adjust(
        &self,
        account: AccountId,
        delta: i64,
        mut extra: BatchItems,
    ) -> EngineResult<u64> {
        let cell = self.lock_cell(account);
        let _guard = cell
            .lock()
            .map_err(|_| EngineError::LedgerConflict(account))?;

        let balance = self.stored_balance(account)?;
        let new_balance = balance as i128 + delta as i128;
        if new_balance < 0 {
            return Err(EngineError::InsufficientFunds {
                balance,
                needed: delta.unsigned_abs(),
            });
        }
        let new_balance = new_balance as u64;

        extra.push((balance_key(account), new_balance.to_le_bytes().to_vec()));
        self.store.batch_write(&extra)?;

        Ok(new_balance)
    }

    /// Settle one round as a single durable transaction.
    ///
    /// Under the account lock: checks the stake against the balance
    /// (failing fast with `InsufficientFunds` and no side effects), hands
    /// the per-account nonce to `resolve`, and commits the stake debit,
    /// payout credit, nonce bump, house delta, and whatever audit items
    /// `resolve` produced as one batch.
    pub(crate) fn settle_round<T, F>(
        &self,
        account: AccountId,
        stake: u64,
        resolve: F,
    ) -> EngineResult<(u64, T)>
    where
        F: FnOnce(u64) -> EngineResult<(u64, T, BatchItems)>,
    {
        let cell = self.lock_cell(account);
        let _guard = cell
            .lock()
            .map_err(|_| EngineError::LedgerConflict(account))?;

        let balance = self.stored_balance(account)?;
        if balance < stake {
            return Err(EngineError::InsufficientFunds {
                balance,
                needed: stake,
            });
        }

        let nonce = self.stored_nonce(account)?;
        let (payout, outcome, mut items) = resolve(nonce)?;
        let new_balance = balance - stake + payout;

        // House lock is always taken after an account lock, never before,
        // so the two orders cannot deadlock.
        let _house = self
            .house_lock
            .lock()
            .map_err(|_| EngineError::LedgerConflict(account))?;
        let house_net = self.house_net()? + stake as i64 - payout as i64;

        items.push((balance_key(account), new_balance.to_le_bytes().to_vec()));
        items.push((nonce_key(account), (nonce + 1).to_le_bytes().to_vec()));
        items.push((HOUSE_NET_KEY.to_vec(), house_net.to_le_bytes().to_vec()));
        self.store.batch_write(&items)?;

        Ok((new_balance, outcome))
    }

    /// Net amount the house has taken from players (negative when the
    /// players are ahead). Settlement conserves
    /// `sum(balances) + house_net` exactly.
    pub fn house_net(&self) -> EngineResult<i64> {
        match self.store.get(HOUSE_NET_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| EngineError::Persistence("corrupt house net record".to_string()))?;
                Ok(i64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }
}
