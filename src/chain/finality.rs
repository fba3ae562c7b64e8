//! Confirmation tracking for destination-chain transactions
//!
//! A transaction counts as final once it reaches the required number of
//! confirmations. The tracker remembers the deepest confirmation count seen
//! per transaction so a count that goes backwards is reported as a reorg.

use super::UtxoChain;
use crate::error::ResolverResult;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FinalityTracker {
    chain: Arc<dyn UtxoChain>,
    required: u32,
    /// txid -> deepest confirmation count observed
    observed: DashMap<String, u32>,
}

impl FinalityTracker {
    pub fn new(chain: Arc<dyn UtxoChain>, required: u32) -> Self {
        Self {
            chain,
            required: required.max(1),
            observed: DashMap::new(),
        }
    }

    pub fn required(&self) -> u32 {
        self.required
    }

    /// Record a confirmation count obtained elsewhere; returns true if final
    pub fn observe(&self, txid: &str, confirmations: u32) -> bool {
        let mut entry = self.observed.entry(txid.to_string()).or_insert(0);
        if confirmations < *entry {
            warn!(
                "Reorg detected on {}: tx {} dropped from {} to {} confirmations",
                self.chain.name(),
                txid,
                *entry,
                confirmations
            );
            crate::metrics::record_reorg(self.chain.name());
        }
        *entry = confirmations;

        let is_final = confirmations >= self.required;
        if is_final {
            debug!(
                "Transaction {} final on {} ({} / {} confirmations)",
                txid,
                self.chain.name(),
                confirmations,
                self.required
            );
        }
        is_final
    }

    /// Current confirmations, `None` if the node no longer knows the tx
    pub async fn confirmations(&self, txid: &str) -> ResolverResult<Option<u32>> {
        match self.chain.get_confirmations(txid).await? {
            Some(confirmations) => {
                self.observe(txid, confirmations);
                Ok(Some(confirmations))
            }
            None => {
                if let Some(previous) = self.observed.get(txid).map(|c| *c) {
                    if previous > 0 {
                        warn!(
                            "Transaction {} with {} confirmations vanished from {}",
                            txid,
                            previous,
                            self.chain.name()
                        );
                        crate::metrics::record_reorg(self.chain.name());
                    }
                }
                self.observed.insert(txid.to_string(), 0);
                Ok(None)
            }
        }
    }

    pub async fn is_final(&self, txid: &str) -> ResolverResult<bool> {
        Ok(self
            .confirmations(txid)
            .await?
            .map(|c| c >= self.required)
            .unwrap_or(false))
    }

    /// Stop tracking a transaction once its order reached a terminal state
    pub fn forget(&self, txid: &str) {
        if self.observed.remove(txid).is_some() {
            info!("Stopped tracking {} on {}", txid, self.chain.name());
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.observed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeUtxoChain;

    #[tokio::test]
    async fn test_finality_threshold_and_reorg() {
        let chain = Arc::new(FakeUtxoChain::new(100));
        let tracker = FinalityTracker::new(chain.clone(), 2);

        chain.set_confirmations("aa", 1);
        assert!(!tracker.is_final("aa").await.unwrap());

        chain.set_confirmations("aa", 3);
        assert!(tracker.is_final("aa").await.unwrap());

        // reorged out
        chain.clear_confirmations("aa");
        assert_eq!(tracker.confirmations("aa").await.unwrap(), None);
        assert!(!tracker.is_final("aa").await.unwrap());

        tracker.forget("aa");
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_observe_without_node_query() {
        let chain = Arc::new(FakeUtxoChain::new(100));
        let tracker = FinalityTracker::new(chain, 1);
        assert!(!tracker.observe("bb", 0));
        assert!(tracker.observe("bb", 1));
    }
}
