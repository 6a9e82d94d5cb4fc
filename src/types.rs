use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque user identifier, assigned by the transport layer.
pub type AccountId = u64;

/// The three faces a toss can land on. Every face is also a biddable side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Heads,
    Tails,
    Edge,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Heads => write!(f, "heads"),
            Side::Tails => write!(f, "tails"),
            Side::Edge => write!(f, "edge"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heads" => Ok(Side::Heads),
            "tails" => Ok(Side::Tails),
            "edge" => Ok(Side::Edge),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Immutable audit record of one settled round.
///
/// Everything needed to re-verify the round is disclosed here: recomputing
/// `commit(server_seed)` must reproduce `commitment`, and re-deriving the
/// HMAC over `"{client_seed}:{nonce}"` must reproduce `outcome` and `roll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Globally monotonic round id.
    pub round_id: u64,
    pub account: AccountId,
    /// Side the player chose.
    pub side: Side,
    /// Stake in minor currency units.
    pub stake: u64,
    /// Hex-encoded server seed, secret until disclosure.
    pub server_seed: String,
    /// Hex-encoded client seed paired with the nonce.
    pub client_seed: String,
    /// Per-account round counter, distinct from `round_id`.
    pub nonce: u64,
    /// Hex SHA-256 of the server seed, binding it before disclosure.
    pub commitment: String,
    /// Face the toss landed on.
    pub outcome: Side,
    /// Uniform value in [0, 1) derived from the HMAC tag. Reporting only;
    /// outcome classification uses exact integer thresholds.
    pub roll: f64,
    /// Credited payout in minor units (zero on a miss).
    pub payout: u64,
    /// Unix millis at settlement.
    pub created_at: i64,
}

/// Full settlement returned to the caller for disclosure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResult {
    pub record: RoundRecord,
    /// Account balance after the round.
    pub balance: u64,
}

/// A cleared external payment, tracked for later reversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    /// External payment reference id, unique per charge.
    pub charge_id: String,
    pub account: AccountId,
    pub amount: u64,
    /// Amount already reversed back to the payer (0 ..= amount).
    pub reversed: u64,
    pub created_at: i64,
}

impl Deposit {
    pub fn unreversed(&self) -> u64 {
        self.amount - self.reversed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Fulfilled,
}

/// A withdrawal shortfall escalated to manual operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: u64,
    pub account: AccountId,
    /// Amount the user asked for.
    pub requested: u64,
    /// Portion satisfied automatically via deposit reversal.
    pub auto_reversed: u64,
    pub status: WithdrawalStatus,
    pub created_at: i64,
}

impl WithdrawalRequest {
    /// Remainder awaiting manual fulfillment.
    pub fn shortfall(&self) -> u64 {
        self.requested - self.auto_reversed
    }
}

/// One deposit the reconciler could not reverse during a withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalFailure {
    pub charge_id: String,
    pub reason: String,
}

/// Result of a withdrawal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalOutcome {
    /// Total reversed automatically across deposits.
    pub auto_reversed: u64,
    /// Present when a shortfall was escalated to manual review.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<WithdrawalRequest>,
    /// Deposits skipped because their reversal did not go through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ReversalFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_round_trips_through_strings() {
        for side in [Side::Heads, Side::Tails, Side::Edge] {
            assert_eq!(side.to_string().parse::<Side>().unwrap(), side);
        }
        assert!("rim".parse::<Side>().is_err());
    }

    #[test]
    fn test_side_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Edge).unwrap(), "\"edge\"");
        let side: Side = serde_json::from_str("\"heads\"").unwrap();
        assert_eq!(side, Side::Heads);
    }

    #[test]
    fn test_withdrawal_shortfall() {
        let req = WithdrawalRequest {
            id: 1,
            account: 7,
            requested: 1500,
            auto_reversed: 1000,
            status: WithdrawalStatus::Pending,
            created_at: 0,
        };
        assert_eq!(req.shortfall(), 500);
    }
}
