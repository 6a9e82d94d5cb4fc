//! Append-only round records.
//!
//! Each settled round is stored under its id together with a newest-first
//! index entry. Records are never mutated or deleted; they are the audit
//! trail every observer re-verifies rounds from.

use crate::errors::{EngineError, EngineResult};
use crate::ledger::BatchItems;
use crate::store::LedgerStore;
use crate::types::RoundRecord;

const ROUND_PREFIX: &str = "round:id:";
const RECENT_INDEX_PREFIX: &[u8] = b"round:index:recent:";

fn round_key(round_id: u64) -> Vec<u8> {
    format!("{}{}", ROUND_PREFIX, round_id).into_bytes()
}

fn recent_index_key(round_id: u64) -> Vec<u8> {
    // Newest-first scans via an inverted id as the sort key.
    let inv = u64::MAX - round_id;
    let mut key = Vec::with_capacity(RECENT_INDEX_PREFIX.len() + 8);
    key.extend_from_slice(RECENT_INDEX_PREFIX);
    key.extend_from_slice(&inv.to_be_bytes());
    key
}

/// Batch items persisting one round: the record plus its index entry.
/// Committed inside the settlement batch, never on their own.
pub fn round_items(record: &RoundRecord) -> EngineResult<BatchItems> {
    let bytes = serde_json::to_vec(record)?;
    Ok(vec![
        (round_key(record.round_id), bytes),
        (recent_index_key(record.round_id), Vec::new()),
    ])
}

pub fn load_round(store: &LedgerStore, round_id: u64) -> EngineResult<Option<RoundRecord>> {
    let Some(bytes) = store.get(&round_key(round_id))? else {
        return Ok(None);
    };

    let record: RoundRecord = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Persistence(format!("corrupt round record {}: {}", round_id, e))
    })?;

    Ok(Some(record))
}

/// Round ids newest-first. Pass the returned cursor back to continue.
pub fn load_recent_round_ids(
    store: &LedgerStore,
    cursor_hex: Option<&str>,
    limit: usize,
) -> EngineResult<(Vec<u64>, Option<String>)> {
    let cursor_bytes = match cursor_hex {
        Some(c) => Some(hex::decode(c).map_err(|e| {
            EngineError::Validation(format!("invalid cursor: {}", e))
        })?),
        None => None,
    };

    let rows = store.scan_prefix(RECENT_INDEX_PREFIX, cursor_bytes.as_deref(), limit.max(1));

    let mut round_ids = Vec::with_capacity(rows.len());
    let mut next_cursor = None;

    for (key, _value) in rows {
        if key.len() != RECENT_INDEX_PREFIX.len() + 8 {
            continue;
        }
        let inv_bytes: [u8; 8] = key[RECENT_INDEX_PREFIX.len()..]
            .try_into()
            .unwrap_or([0u8; 8]);
        round_ids.push(u64::MAX - u64::from_be_bytes(inv_bytes));
        next_cursor = Some(hex::encode(&key));
    }

    Ok((round_ids, next_cursor))
}

/// Recover the next round id after a restart: one past the newest stored
/// round, or 1 for an empty store.
pub fn recover_next_round_id(store: &LedgerStore) -> EngineResult<u64> {
    let (ids, _) = load_recent_round_ids(store, None, 1)?;
    Ok(ids.first().map(|id| id + 1).unwrap_or(1))
}
