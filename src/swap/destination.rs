//! Destination-chain adapters
//!
//! UTXO execution params layout (big-endian):
//!
//! ```text
//! [0..20)   maker recipient pubkey hash
//! [20..28)  destination amount, satoshis
//! [28..32)  optional HTLC timelock override, blocks
//! ```

use crate::error::{ResolverError, ResolverResult};
use crate::utxo::selector::funding_fee;

const PKH_LEN: usize = 20;
const BASE_LEN: usize = PKH_LEN + 8;
const WITH_TIMELOCK_LEN: usize = BASE_LEN + 4;
/// Largest block count a relative lock time can express
pub const MAX_RELATIVE_TIMELOCK_BLOCKS: u32 = 0xffff;

/// Narrow contract the engine needs from a destination chain
#[cfg_attr(test, mockall::automock)]
pub trait DestinationAdapter: Send + Sync {
    fn validate_execution_params(&self, params: &[u8]) -> bool;

    /// Cost of executing on the destination chain, in its base unit
    fn estimate_execution_cost(&self, params: &[u8], fee_rate: u64) -> ResolverResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoExecutionParams {
    pub recipient_pubkey_hash: [u8; 20],
    pub amount: u64,
    pub timelock_override: Option<u32>,
}

impl UtxoExecutionParams {
    pub fn parse(bytes: &[u8]) -> ResolverResult<Self> {
        if bytes.len() != BASE_LEN && bytes.len() != WITH_TIMELOCK_LEN {
            return Err(ResolverError::InvalidExecutionParams(format!(
                "expected {} or {} bytes, got {}",
                BASE_LEN,
                WITH_TIMELOCK_LEN,
                bytes.len()
            )));
        }

        let mut recipient_pubkey_hash = [0u8; PKH_LEN];
        recipient_pubkey_hash.copy_from_slice(&bytes[..PKH_LEN]);
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&bytes[PKH_LEN..BASE_LEN]);
        let timelock_override = bytes.get(BASE_LEN..WITH_TIMELOCK_LEN).map(|raw| {
            let mut tl = [0u8; 4];
            tl.copy_from_slice(raw);
            u32::from_be_bytes(tl)
        });

        Ok(Self {
            recipient_pubkey_hash,
            amount: u64::from_be_bytes(amount),
            timelock_override,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WITH_TIMELOCK_LEN);
        out.extend_from_slice(&self.recipient_pubkey_hash);
        out.extend_from_slice(&self.amount.to_be_bytes());
        if let Some(timelock) = self.timelock_override {
            out.extend_from_slice(&timelock.to_be_bytes());
        }
        out
    }
}

/// Adapter for the UTXO destination funded through an HTLC
pub struct UtxoDestination {
    dust_threshold: u64,
}

impl UtxoDestination {
    pub fn new(dust_threshold: u64) -> Self {
        Self { dust_threshold }
    }
}

impl DestinationAdapter for UtxoDestination {
    fn validate_execution_params(&self, params: &[u8]) -> bool {
        match UtxoExecutionParams::parse(params) {
            Ok(p) => {
                p.amount >= self.dust_threshold
                    && p.recipient_pubkey_hash != [0u8; PKH_LEN]
                    && p
                        .timelock_override
                        .map_or(true, |t| t > 0 && t <= MAX_RELATIVE_TIMELOCK_BLOCKS)
            }
            Err(_) => false,
        }
    }

    fn estimate_execution_cost(&self, params: &[u8], fee_rate: u64) -> ResolverResult<u64> {
        UtxoExecutionParams::parse(params)?;
        // single-input funding; larger selections eat into the margin
        Ok(funding_fee(1, fee_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layout() {
        let mut raw = vec![0xab; 20];
        raw.extend_from_slice(&50_000u64.to_be_bytes());
        let params = UtxoExecutionParams::parse(&raw).unwrap();
        assert_eq!(params.recipient_pubkey_hash, [0xab; 20]);
        assert_eq!(params.amount, 50_000);
        assert_eq!(params.timelock_override, None);

        raw.extend_from_slice(&10u32.to_be_bytes());
        let params = UtxoExecutionParams::parse(&raw).unwrap();
        assert_eq!(params.timelock_override, Some(10));
        assert_eq!(params.encode(), raw);

        assert!(UtxoExecutionParams::parse(&raw[..27]).is_err());
    }

    #[test]
    fn test_validation_rules() {
        let adapter = UtxoDestination::new(546);
        let params = |pkh: u8, amount: u64, timelock: Option<u32>| {
            UtxoExecutionParams {
                recipient_pubkey_hash: [pkh; 20],
                amount,
                timelock_override: timelock,
            }
            .encode()
        };

        assert!(adapter.validate_execution_params(&params(1, 10_000, None)));
        assert!(adapter.validate_execution_params(&params(1, 10_000, Some(20))));
        assert!(!adapter.validate_execution_params(&params(0, 10_000, None)));
        assert!(!adapter.validate_execution_params(&params(1, 100, None)));
        assert!(!adapter.validate_execution_params(&params(1, 10_000, Some(0))));
        assert!(adapter.validate_execution_params(&params(1, 10_000, Some(0xffff))));
        assert!(!adapter.validate_execution_params(&params(1, 10_000, Some(0x1_0000))));
        assert!(!adapter.validate_execution_params(&params(1, 10_000, Some(u32::MAX))));
        assert!(!adapter.validate_execution_params(b"short"));
    }

    #[test]
    fn test_cost_follows_fee_rate() {
        let adapter = UtxoDestination::new(546);
        let raw = UtxoExecutionParams {
            recipient_pubkey_hash: [1; 20],
            amount: 10_000,
            timelock_override: None,
        }
        .encode();
        let low = adapter.estimate_execution_cost(&raw, 1).unwrap();
        let high = adapter.estimate_execution_cost(&raw, 10).unwrap();
        assert_eq!(high, low * 10);
    }
}
