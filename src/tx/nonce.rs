//! Nonce management for the resolver's source-chain account
//!
//! Handles:
//! - Local nonce tracking so concurrent settlements do not collide
//! - Release of nonces whose transaction never reached the network
//! - Re-sync with the chain after "nonce too low" rejections

use crate::chain::ChainProvider;
use crate::error::{ResolverError, ResolverResult};

use ethers::prelude::*;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted but unconfirmed: nonce -> tx hash
    pending: BTreeMap<u64, String>,
}

pub struct NonceManager {
    wallet_address: Address,
    chain_id: u64,
    state: Mutex<Option<NonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address, chain_id: u64) -> Self {
        Self {
            wallet_address,
            chain_id,
            state: Mutex::new(None),
        }
    }

    fn not_initialized(&self) -> ResolverError {
        ResolverError::Nonce {
            chain_id: self.chain_id,
            message: "Nonce manager not initialized".to_string(),
        }
    }

    /// Initialize from the on-chain pending nonce
    pub async fn init(&self, provider: &ChainProvider) -> ResolverResult<()> {
        let on_chain = self.fetch_nonce(provider).await?;
        *self.state.lock().await = Some(NonceState {
            current: on_chain,
            pending: BTreeMap::new(),
        });
        debug!("Initialized nonce for chain {}: {}", self.chain_id, on_chain);
        Ok(())
    }

    /// Allocate the next nonce
    pub async fn next(&self) -> ResolverResult<u64> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        let nonce = state.current;
        state.current += 1;
        debug!("Allocated nonce {} for chain {}", nonce, self.chain_id);
        Ok(nonce)
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) -> ResolverResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        state.pending.insert(nonce, tx_hash.to_string());
        Ok(())
    }

    /// Give back a nonce whose transaction was never accepted
    pub async fn release(&self, nonce: u64) -> ResolverResult<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;
        state.pending.remove(&nonce);
        if nonce + 1 == state.current {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync with on-chain state, dropping confirmed pending entries
    pub async fn sync(&self, provider: &ChainProvider) -> ResolverResult<()> {
        let on_chain = self.fetch_nonce(provider).await?;
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| self.not_initialized())?;

        if on_chain > state.current {
            warn!(
                "Nonce gap on chain {}: local {}, on-chain {}",
                self.chain_id, state.current, on_chain
            );
            state.current = on_chain;
        }
        state.pending = state.pending.split_off(&on_chain);
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    async fn fetch_nonce(&self, provider: &ChainProvider) -> ResolverResult<u64> {
        let nonce = provider
            .http()
            .get_transaction_count(self.wallet_address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| ResolverError::Nonce {
                chain_id: self.chain_id,
                message: e.to_string(),
            })?;

        Ok(nonce.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(start: u64) -> NonceManager {
        let manager = NonceManager::new(Address::zero(), 1);
        *manager.state.lock().await = Some(NonceState {
            current: start,
            pending: BTreeMap::new(),
        });
        manager
    }

    #[tokio::test]
    async fn test_uninitialized_manager_refuses_nonces() {
        let manager = NonceManager::new(Address::zero(), 1);
        assert!(matches!(
            manager.next().await,
            Err(ResolverError::Nonce { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_reuses_last_nonce() {
        let manager = seeded(7).await;
        assert_eq!(manager.next().await.unwrap(), 7);
        let n = manager.next().await.unwrap();
        assert_eq!(n, 8);

        manager.mark_pending(n, "0xabc").await.unwrap();
        assert_eq!(manager.pending_count().await, 1);

        manager.release(n).await.unwrap();
        assert_eq!(manager.pending_count().await, 0);
        assert_eq!(manager.next().await.unwrap(), 8);
    }
}
