//! Execution state machine and the per-order execution context

use super::order::{Order, OrderHash};
use crate::error::{ResolverError, ResolverResult};
use crate::htlc::HtlcParams;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of one order's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Discovered,
    /// Analyzed and found profitable
    Analyzed,
    /// Analyzed and found unprofitable
    Skipped,
    Matched,
    HtlcFunded,
    ClaimDetected,
    Settled,
    RefundPending,
    Refunded,
    Failed,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 10] = [
        SwapStatus::Discovered,
        SwapStatus::Analyzed,
        SwapStatus::Skipped,
        SwapStatus::Matched,
        SwapStatus::HtlcFunded,
        SwapStatus::ClaimDetected,
        SwapStatus::Settled,
        SwapStatus::RefundPending,
        SwapStatus::Refunded,
        SwapStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Discovered => "discovered",
            SwapStatus::Analyzed => "analyzed",
            SwapStatus::Skipped => "skipped",
            SwapStatus::Matched => "matched",
            SwapStatus::HtlcFunded => "htlc_funded",
            SwapStatus::ClaimDetected => "claim_detected",
            SwapStatus::Settled => "settled",
            SwapStatus::RefundPending => "refund_pending",
            SwapStatus::Refunded => "refunded",
            SwapStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Skipped | SwapStatus::Settled | SwapStatus::Refunded | SwapStatus::Failed
        )
    }

    /// Funds are locked on the destination chain in this state
    pub fn is_funded(&self) -> bool {
        matches!(
            self,
            SwapStatus::HtlcFunded | SwapStatus::ClaimDetected | SwapStatus::RefundPending
        )
    }

    /// Legal transitions of the execution state machine
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        matches!(
            (self, next),
            (Discovered, Analyzed)
                | (Discovered, Skipped)
                | (Discovered, Failed)
                | (Analyzed, Matched)
                | (Analyzed, Failed)
                | (Matched, HtlcFunded)
                | (Matched, RefundPending)
                | (Matched, Failed)
                | (HtlcFunded, ClaimDetected)
                | (HtlcFunded, RefundPending)
                | (ClaimDetected, Settled)
                | (RefundPending, Refunded)
                // the claim confirmed before our refund did
                | (RefundPending, ClaimDetected)
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ResolverError::Internal(format!("unknown status '{}'", s)))
    }
}

/// Destination HTLC as built and funded by the resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcRecord {
    pub params: HtlcParams,
    pub script_hex: String,
    pub locking_address: String,
    /// Derivation path of the refund key
    pub refund_key_path: String,
    pub value: u64,
    pub funding_txid: Option<String>,
    /// Signed funding transaction, kept so it can be rebroadcast after a crash
    pub funding_tx_hex: Option<String>,
    pub output_index: Option<u32>,
    /// Height the funding transaction confirmed at
    pub funding_height: Option<u64>,
    /// Outpoints the funding transaction spends
    pub funding_inputs: Vec<String>,
}

impl HtlcRecord {
    pub fn script(&self) -> ResolverResult<Vec<u8>> {
        hex::decode(&self.script_hex)
            .map_err(|e| ResolverError::Script(format!("stored script is not hex: {}", e)))
    }
}

/// Outcome of the profitability analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub profit: i64,
    pub risk: f64,
    pub priority: f64,
    pub destination_fee: u64,
    pub source_fee: u64,
    pub fee_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: SwapStatus,
    pub to: SwapStatus,
    pub at: DateTime<Utc>,
}

/// Everything the engine knows about one order's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub order: Order,
    pub status: SwapStatus,
    pub analysis: Option<AnalysisRecord>,
    pub destination_htlc: Option<HtlcRecord>,
    /// Maker's claim of the destination HTLC
    pub claim_tx_id: Option<String>,
    pub refund_tx_id: Option<String>,
    /// Source-chain completion that revealed the secret there
    pub settlement_tx_id: Option<String>,
    pub secret: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(order: Order) -> Self {
        let now = Utc::now();
        Self {
            order,
            status: SwapStatus::Discovered,
            analysis: None,
            destination_htlc: None,
            claim_tx_id: None,
            refund_tx_id: None,
            settlement_tx_id: None,
            secret: None,
            retry_count: 0,
            last_error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn order_hash(&self) -> OrderHash {
        self.order.order_hash
    }

    /// Move to `next`, returning the previous status
    pub fn advance(&mut self, next: SwapStatus) -> ResolverResult<SwapStatus> {
        if !self.status.can_transition_to(next) {
            return Err(ResolverError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let prev = self.status;
        let now = Utc::now();
        self.history.push(StatusChange {
            from: prev,
            to: next,
            at: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(prev)
    }

    /// Record the revealed preimage; rejected unless it hashes to the hashlock
    pub fn record_secret(&mut self, secret: &[u8; 32]) -> ResolverResult<()> {
        if !self.order.verify_secret(secret) {
            return Err(ResolverError::SecretMismatch {
                order_hash: self.order.order_hash.to_string(),
            });
        }
        self.secret = Some(hex::encode(secret));
        self.touch();
        Ok(())
    }

    pub fn secret_bytes(&self) -> Option<[u8; 32]> {
        let raw = hex::decode(self.secret.as_ref()?).ok()?;
        raw.try_into().ok()
    }

    pub fn record_error(&mut self, error: &ResolverError) {
        self.last_error = Some(error.to_string());
        self.retry_count += 1;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Read-only view for operators
    pub fn snapshot(&self) -> OrderSnapshot {
        let htlc = self.destination_htlc.as_ref();
        OrderSnapshot {
            order_hash: self.order.order_hash,
            status: self.status,
            maker: self.order.maker.clone(),
            expiry_time: self.order.expiry_time,
            locking_address: htlc.map(|h| h.locking_address.clone()),
            funding_tx_id: htlc.and_then(|h| h.funding_txid.clone()),
            claim_tx_id: self.claim_tx_id.clone(),
            refund_tx_id: self.refund_tx_id.clone(),
            settlement_tx_id: self.settlement_tx_id.clone(),
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Operator-facing export of one order
#[derive(Debug, Clone, Serialize)]
pub struct OrderSnapshot {
    pub order_hash: OrderHash,
    pub status: SwapStatus,
    pub maker: String,
    pub expiry_time: u64,
    pub locking_address: Option<String>,
    pub funding_tx_id: Option<String>,
    pub claim_tx_id: Option<String>,
    pub refund_tx_id: Option<String>,
    pub settlement_tx_id: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_cannot_skip_to_funded() {
        let mut ctx = ExecutionContext::new(testing::order(1, 20));
        assert!(ctx.advance(SwapStatus::HtlcFunded).is_err());
        assert!(ctx.advance(SwapStatus::Matched).is_err());
        assert_eq!(ctx.status, SwapStatus::Discovered);

        ctx.advance(SwapStatus::Analyzed).unwrap();
        assert!(ctx.advance(SwapStatus::HtlcFunded).is_err());
        ctx.advance(SwapStatus::Matched).unwrap();
        ctx.advance(SwapStatus::HtlcFunded).unwrap();
        assert_eq!(ctx.history.len(), 3);
    }

    #[test]
    fn test_funded_orders_only_end_settled_or_refunded() {
        // walk every reachable state from htlc_funded
        let mut seen = vec![SwapStatus::HtlcFunded];
        let mut frontier = vec![SwapStatus::HtlcFunded];
        while let Some(state) = frontier.pop() {
            for next in SwapStatus::ALL {
                if state.can_transition_to(next) && !seen.contains(&next) {
                    seen.push(next);
                    frontier.push(next);
                }
            }
        }
        let terminals: Vec<_> = seen.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminals.len(), 2);
        assert!(terminals.contains(&SwapStatus::Settled));
        assert!(terminals.contains(&SwapStatus::Refunded));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in SwapStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for next in SwapStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in SwapStatus::ALL {
            assert_eq!(status.as_str().parse::<SwapStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_record_secret_checks_hashlock() {
        let mut ctx = ExecutionContext::new(testing::order(3, 20));
        assert!(matches!(
            ctx.record_secret(&[0u8; 32]),
            Err(ResolverError::SecretMismatch { .. })
        ));
        assert!(ctx.secret.is_none());

        let secret = testing::secret_for(3);
        ctx.record_secret(&secret).unwrap();
        assert_eq!(ctx.secret_bytes(), Some(secret));
    }
}
