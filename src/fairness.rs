//! Provably-fair outcome derivation.
//!
//! A round is settled from `(server_seed, client_seed, nonce)` with an
//! HMAC-SHA256 commit-reveal construction: the server seed is bound by a
//! SHA-256 commitment, the MAC tag over `"{client_seed}:{nonce}"` yields a
//! uniform 64-bit value, and fixed integer thresholds map it to a face.
//! Anyone holding a disclosed [`RoundRecord`](crate::types::RoundRecord) can
//! recompute all of it.
//!
//! Note the commitment is currently disclosed in the same message as the
//! seed, so it proves the seed was not altered after generation but does not
//! prevent seed selection before disclosure. A prior publication step would
//! close that gap.

use crate::config::{OddsConfig, PayoutConfig};
use crate::errors::{EngineError, EngineResult};
use crate::types::{RoundRecord, Side};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const PPM_SCALE: u128 = 1_000_000;

/// Generate 32 bytes of cryptographically secure seed material, hex-encoded.
pub fn generate_seed() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One-way commitment to a server seed: hex SHA-256 over its UTF-8 bytes.
pub fn commit(server_seed: &str) -> String {
    hex::encode(Sha256::digest(server_seed.as_bytes()))
}

/// Outcome thresholds pre-scaled to exact integers.
///
/// Probabilities are converted to parts-per-million and mapped onto the u64
/// tag space as `ppm * 2^64 / 10^6`, so classifying a tag is a pure integer
/// comparison and the interval boundaries carry no floating-point drift.
/// Declared order: `[0, heads)` heads, `[heads, edge)` edge, `[edge, 2^64)`
/// tails.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeTable {
    t_heads: u128,
    t_edge: u128,
}

impl OutcomeTable {
    pub fn new(odds: &OddsConfig) -> EngineResult<Self> {
        let ppm_heads = to_ppm("odds.p_heads", odds.p_heads)?;
        let ppm_edge = to_ppm("odds.p_edge", odds.p_edge)?;
        if ppm_heads + ppm_edge >= PPM_SCALE {
            return Err(EngineError::Configuration {
                field: "odds".to_string(),
                value: format!("{} + {}", odds.p_heads, odds.p_edge),
                reason: "heads + edge must leave a positive tails residual".to_string(),
            });
        }

        Ok(Self {
            t_heads: scale_ppm(ppm_heads),
            t_edge: scale_ppm(ppm_heads + ppm_edge),
        })
    }

    /// Map a 64-bit tag value to a face.
    pub fn classify(&self, n: u64) -> Side {
        let n = n as u128;
        if n < self.t_heads {
            Side::Heads
        } else if n < self.t_edge {
            Side::Edge
        } else {
            Side::Tails
        }
    }
}

fn to_ppm(field: &str, p: f64) -> EngineResult<u128> {
    if !(p > 0.0 && p < 1.0) {
        return Err(EngineError::Configuration {
            field: field.to_string(),
            value: p.to_string(),
            reason: "must be in (0, 1)".to_string(),
        });
    }
    Ok((p * PPM_SCALE as f64).round() as u128)
}

fn scale_ppm(ppm: u128) -> u128 {
    ppm * (1u128 << 64) / PPM_SCALE
}

/// Derive the outcome for one round. Pure and deterministic: identical
/// inputs always reproduce the identical `(outcome, x)` pair.
pub fn derive(
    server_seed: &str,
    client_seed: &str,
    nonce: u64,
    table: &OutcomeTable,
) -> (Side, f64) {
    let n = derive_tag(server_seed, client_seed, nonce);
    let x = n as f64 / (u64::MAX as f64 + 1.0);
    (table.classify(n), x)
}

/// First 8 bytes of HMAC-SHA256(server_seed, "{client_seed}:{nonce}") as a
/// big-endian u64.
fn derive_tag(server_seed: &str, client_seed: &str, nonce: u64) -> u64 {
    let mut mac = HmacSha256::new_from_slice(server_seed.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(format!("{}:{}", client_seed, nonce).as_bytes());
    let tag = mac.finalize().into_bytes();

    let mut first = [0u8; 8];
    first.copy_from_slice(&tag[..8]);
    u64::from_be_bytes(first)
}

/// Payout multipliers resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PayoutTable {
    side_multiplier: f64,
    edge_multiplier: f64,
}

impl PayoutTable {
    pub fn new(payouts: &PayoutConfig) -> Self {
        Self {
            side_multiplier: payouts.side_multiplier,
            edge_multiplier: payouts.edge_multiplier,
        }
    }
}

/// Payout rule. Edge pays the edge multiplier to whoever is in the round;
/// a matched side pays the side multiplier; a miss pays nothing. Rounding
/// is half-away-from-zero to integer minor units.
pub fn payout(outcome: Side, chosen: Side, stake: u64, table: &PayoutTable) -> u64 {
    let multiplier = if outcome == Side::Edge {
        table.edge_multiplier
    } else if outcome == chosen {
        table.side_multiplier
    } else {
        return 0;
    };

    (stake as f64 * multiplier).round() as u64
}

/// Re-verify a disclosed round record: commitment, outcome, roll, and
/// payout must all reproduce from the disclosed seeds.
pub fn verify_round(
    record: &RoundRecord,
    outcomes: &OutcomeTable,
    payouts: &PayoutTable,
) -> bool {
    if commit(&record.server_seed) != record.commitment {
        return false;
    }

    let (outcome, roll) = derive(
        &record.server_seed,
        &record.client_seed,
        record.nonce,
        outcomes,
    );
    if outcome != record.outcome || roll != record.roll {
        return false;
    }

    payout(outcome, record.side, record.stake, payouts) == record.payout
}
