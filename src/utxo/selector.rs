//! Largest-first coin selection

use crate::chain::Coin;
use crate::error::{ResolverError, ResolverResult};

/// Version, locktime, counts and segwit marker
pub const TX_OVERHEAD_VBYTES: u64 = 11;
pub const P2WPKH_INPUT_VBYTES: u64 = 68;
pub const P2WPKH_OUTPUT_VBYTES: u64 = 31;
pub const P2WSH_OUTPUT_VBYTES: u64 = 43;
/// HTLC input spent through either branch, witness discounted
pub const HTLC_INPUT_VBYTES: u64 = 100;

/// Virtual size of a P2WPKH-funded transaction
pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES
        + P2WPKH_INPUT_VBYTES * inputs as u64
        + P2WPKH_OUTPUT_VBYTES * outputs as u64
}

/// Fee for a funding transaction: HTLC output plus change
pub fn funding_fee(inputs: usize, fee_rate: u64) -> u64 {
    let vsize = estimate_vsize(inputs, 1) + P2WSH_OUTPUT_VBYTES;
    vsize * fee_rate
}

/// Fee for a single-input HTLC spend paying one P2WPKH output
pub fn htlc_spend_fee(fee_rate: u64) -> u64 {
    (TX_OVERHEAD_VBYTES + HTLC_INPUT_VBYTES + P2WPKH_OUTPUT_VBYTES) * fee_rate
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Coin>,
    pub fee: u64,
    /// Zero when the remainder was folded into the fee
    pub change: u64,
}

impl Selection {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|c| c.value).sum()
    }
}

pub struct UtxoSelector {
    dust_threshold: u64,
}

impl UtxoSelector {
    pub fn new(dust_threshold: u64) -> Self {
        Self { dust_threshold }
    }

    /// Pick coins covering `target` plus the fee at `fee_rate` sat/vB
    ///
    /// The fee is recomputed after each added coin. A remainder below the
    /// dust threshold goes to the fee instead of a change output.
    pub fn select(&self, coins: &[Coin], target: u64, fee_rate: u64) -> ResolverResult<Selection> {
        if target == 0 {
            return Err(ResolverError::InvalidExecutionParams(
                "funding target must be positive".to_string(),
            ));
        }

        let mut candidates: Vec<&Coin> = coins.iter().collect();
        candidates.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.txid.cmp(&b.txid))
                .then_with(|| a.vout.cmp(&b.vout))
        });

        let mut inputs = Vec::new();
        let mut total = 0u64;
        for coin in candidates {
            inputs.push(coin.clone());
            total = total.saturating_add(coin.value);

            let fee = funding_fee(inputs.len(), fee_rate);
            let required = target.saturating_add(fee);
            if total >= required {
                let remainder = total - required;
                let (fee, change) = if remainder < self.dust_threshold {
                    (fee + remainder, 0)
                } else {
                    (fee, remainder)
                };
                return Ok(Selection {
                    inputs,
                    fee,
                    change,
                });
            }
        }

        Err(ResolverError::InsufficientFunds {
            available: total,
            required: target.saturating_add(funding_fee(coins.len().max(1), fee_rate)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(n: u8, value: u64) -> Coin {
        Coin {
            txid: format!("{:064x}", n),
            vout: 0,
            value,
            script_pubkey: vec![0x00, 0x14],
            confirmations: 1,
        }
    }

    #[test]
    fn test_largest_first_with_change() {
        let selector = UtxoSelector::new(546);
        let coins = vec![coin(1, 10_000), coin(2, 50_000), coin(3, 20_000)];

        let selection = selector.select(&coins, 30_000, 2).unwrap();
        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value, 50_000);
        assert_eq!(selection.fee, funding_fee(1, 2));
        assert_eq!(
            selection.input_total(),
            30_000 + selection.fee + selection.change
        );
    }

    #[test]
    fn test_fee_recomputed_per_input() {
        let selector = UtxoSelector::new(546);
        let coins = vec![coin(1, 20_000), coin(2, 20_000), coin(3, 20_000)];

        let selection = selector.select(&coins, 39_900, 1).unwrap();
        // two coins cover the target but not the two-input fee
        assert_eq!(selection.inputs.len(), 3);
        assert!(selection.input_total() >= 39_900 + funding_fee(3, 1));
    }

    #[test]
    fn test_dust_change_folded_into_fee() {
        let selector = UtxoSelector::new(546);
        let fee = funding_fee(1, 1);
        let coins = vec![coin(1, 10_000 + fee + 500)];

        let selection = selector.select(&coins, 10_000, 1).unwrap();
        assert_eq!(selection.change, 0);
        assert_eq!(selection.fee, fee + 500);
    }

    #[test]
    fn test_insufficient_funds() {
        let selector = UtxoSelector::new(546);
        let coins = vec![coin(1, 1_000), coin(2, 2_000)];

        match selector.select(&coins, 2_900, 1) {
            Err(ResolverError::InsufficientFunds {
                available,
                required,
            }) => {
                assert_eq!(available, 3_000);
                assert!(required > available);
            }
            other => panic!("expected insufficient funds, got {:?}", other),
        }
        assert!(selector.select(&[], 1, 1).is_err());
    }

    #[test]
    fn test_never_under_covers() {
        let selector = UtxoSelector::new(546);
        let coins: Vec<Coin> = (1..=20).map(|n| coin(n, n as u64 * 1_337)).collect();
        for target in [1_000u64, 25_000, 100_000, 200_000] {
            for rate in [1u64, 5, 30] {
                if let Ok(sel) = selector.select(&coins, target, rate) {
                    assert!(sel.input_total() >= target + funding_fee(sel.inputs.len(), rate));
                    assert!(sel.change == 0 || sel.change >= 546);
                }
            }
        }
    }
}
