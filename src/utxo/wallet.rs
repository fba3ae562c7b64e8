//! Single-writer coordinator for the resolver's destination-chain wallet
//!
//! Concurrent executions share one coin set. Selection, signing and
//! broadcast for a funding transaction happen while holding the wallet
//! lock, and the spent outpoints stay reserved until the node stops listing
//! them, so two fundings can never pick the same coin.

use super::builder::{sign_p2wpkh_inputs, unsigned_funding, HTLC_OUTPUT_INDEX};
use super::selector::UtxoSelector;
use crate::chain::{ChainKind, Coin, UtxoChain};
use crate::error::ResolverResult;
use crate::signing::{DerivedKey, SigningProvider};

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::{ScriptBuf, WPubkeyHash};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, info, warn};

/// A signed funding transaction that has not been broadcast yet
#[derive(Debug, Clone)]
pub struct PreparedFunding {
    pub txid: String,
    pub tx_hex: String,
    pub output_index: u32,
    pub inputs: Vec<String>,
    pub fee: u64,
}

pub struct WalletCoordinator {
    chain: Arc<dyn UtxoChain>,
    signer: Arc<dyn SigningProvider>,
    key_path: String,
    selector: UtxoSelector,
    key: OnceCell<DerivedKey>,
    /// Outpoint -> txid of our transaction spending it
    reserved: Mutex<HashMap<String, String>>,
    funding_lock: Mutex<()>,
}

/// Exclusive access to the wallet for one select, persist, broadcast cycle
pub struct FundingSession<'a> {
    wallet: &'a WalletCoordinator,
    _guard: MutexGuard<'a, ()>,
}

impl WalletCoordinator {
    pub fn new(
        chain: Arc<dyn UtxoChain>,
        signer: Arc<dyn SigningProvider>,
        key_path: String,
        dust_threshold: u64,
    ) -> Self {
        Self {
            chain,
            signer,
            key_path,
            selector: UtxoSelector::new(dust_threshold),
            key: OnceCell::new(),
            reserved: Mutex::new(HashMap::new()),
            funding_lock: Mutex::new(()),
        }
    }

    pub async fn key(&self) -> ResolverResult<&DerivedKey> {
        self.key
            .get_or_try_init(|| self.signer.derive_key(ChainKind::Bitcoin, &self.key_path))
            .await
    }

    pub async fn address(&self) -> ResolverResult<String> {
        Ok(self.key().await?.address.clone())
    }

    /// P2WPKH output script paying the wallet, used for change and refunds
    pub async fn script_pubkey(&self) -> ResolverResult<ScriptBuf> {
        let key = self.key().await?;
        Ok(ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(
            key.public_key_hash,
        )))
    }

    /// Wait for exclusive use of the coin set
    pub async fn begin(&self) -> FundingSession<'_> {
        FundingSession {
            wallet: self,
            _guard: self.funding_lock.lock().await,
        }
    }

    /// Spendable coins, excluding those reserved by our own broadcasts
    async fn available_coins(&self) -> ResolverResult<Vec<Coin>> {
        let address = self.address().await?;
        let listed = self.chain.list_coins(&address).await?;

        let listed_outpoints: HashSet<String> = listed.iter().map(Coin::outpoint).collect();
        let mut reserved = self.reserved.lock().await;
        // a reserved coin the node no longer lists has been spent for good
        reserved.retain(|outpoint, _| listed_outpoints.contains(outpoint));

        let total: u64 = listed.iter().map(|c| c.value).sum();
        crate::metrics::set_wallet_balance(self.chain.name(), total);

        Ok(listed
            .into_iter()
            .filter(|coin| !reserved.contains_key(&coin.outpoint()))
            .collect())
    }

    async fn reserve(&self, inputs: &[String], txid: &str) {
        let mut reserved = self.reserved.lock().await;
        for outpoint in inputs {
            reserved.insert(outpoint.clone(), txid.to_string());
        }
    }

    async fn release(&self, inputs: &[String]) {
        let mut reserved = self.reserved.lock().await;
        for outpoint in inputs {
            reserved.remove(outpoint);
        }
    }

    pub async fn reserved_count(&self) -> usize {
        self.reserved.lock().await.len()
    }
}

impl<'a> FundingSession<'a> {
    /// Select coins and sign a transaction paying `value` to `htlc_script_pubkey`
    pub async fn prepare(
        &self,
        htlc_script_pubkey: &ScriptBuf,
        value: u64,
    ) -> ResolverResult<PreparedFunding> {
        let wallet = self.wallet;
        let fee_rate = wallet.chain.estimate_fee_rate().await?;
        let coins = wallet.available_coins().await?;
        let selection = wallet.selector.select(&coins, value, fee_rate)?;

        let key = wallet.key().await?;
        let change_script = wallet.script_pubkey().await?;
        let mut tx = unsigned_funding(&selection, htlc_script_pubkey, value, &change_script)?;
        sign_p2wpkh_inputs(
            &mut tx,
            &selection.inputs,
            wallet.signer.as_ref(),
            &wallet.key_path,
            &key.public_key,
        )
        .await?;

        let prepared = PreparedFunding {
            txid: tx.compute_txid().to_string(),
            tx_hex: serialize_hex(&tx),
            output_index: HTLC_OUTPUT_INDEX,
            inputs: selection.inputs.iter().map(Coin::outpoint).collect(),
            fee: selection.fee,
        };
        debug!(
            "Prepared funding {} with {} inputs, fee {} sat at {} sat/vB",
            prepared.txid,
            prepared.inputs.len(),
            prepared.fee,
            fee_rate
        );
        Ok(prepared)
    }

    /// Give back the inputs of a funding transaction that will never be sent
    pub async fn abandon(&self, funding: &PreparedFunding) {
        self.wallet.release(&funding.inputs).await;
        debug!(
            "Released {} inputs of abandoned funding {}",
            funding.inputs.len(),
            funding.txid
        );
    }

    /// Broadcast a prepared (or previously persisted) funding transaction
    ///
    /// Inputs are reserved on success and on transient failures, since the
    /// transaction may have reached the network anyway.
    pub async fn broadcast(&self, funding: &PreparedFunding) -> ResolverResult<String> {
        let wallet = self.wallet;
        match wallet.chain.broadcast(&funding.tx_hex).await {
            Ok(txid) => {
                wallet.reserve(&funding.inputs, &txid).await;
                info!("Broadcast funding transaction {}", txid);
                Ok(txid)
            }
            Err(e) => {
                if let Ok(Some(_)) = wallet.chain.get_confirmations(&funding.txid).await {
                    warn!(
                        "Broadcast of {} reported an error but the node knows it: {}",
                        funding.txid, e
                    );
                    wallet.reserve(&funding.inputs, &funding.txid).await;
                    return Ok(funding.txid.clone());
                }
                if e.is_retryable() {
                    wallet.reserve(&funding.inputs, &funding.txid).await;
                } else {
                    wallet.release(&funding.inputs).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolverError;
    use crate::testing::{fake_signer, FakeUtxoChain};

    async fn wallet_with(values: &[u64]) -> (Arc<FakeUtxoChain>, WalletCoordinator) {
        let chain = Arc::new(FakeUtxoChain::new(100));
        let signer = fake_signer();
        let wallet = WalletCoordinator::new(
            chain.clone(),
            signer,
            "m/84'/1'/0'/0/0".to_string(),
            546,
        );
        let address = wallet.address().await.unwrap();
        let script = wallet.script_pubkey().await.unwrap();
        for (n, value) in values.iter().enumerate() {
            chain.add_coin(&address, n as u8 + 1, *value, script.to_bytes());
        }
        (chain, wallet)
    }

    #[tokio::test]
    async fn test_broadcast_reserves_inputs() {
        let (chain, wallet) = wallet_with(&[60_000, 60_000]).await;
        let htlc_spk = ScriptBuf::from_bytes(vec![0x00; 34]);

        let first = {
            let session = wallet.begin().await;
            let prepared = session.prepare(&htlc_spk, 40_000).await.unwrap();
            session.broadcast(&prepared).await.unwrap();
            prepared
        };
        let second = {
            let session = wallet.begin().await;
            let prepared = session.prepare(&htlc_spk, 40_000).await.unwrap();
            session.broadcast(&prepared).await.unwrap();
            prepared
        };

        assert_ne!(first.inputs, second.inputs);
        assert_eq!(wallet.reserved_count().await, 2);
        assert_eq!(chain.broadcast_count(), 2);

        // all coins reserved: the third funding cannot select anything
        let session = wallet.begin().await;
        assert!(matches!(
            session.prepare(&htlc_spk, 40_000).await,
            Err(ResolverError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_reservations_pruned_once_spent() {
        let (chain, wallet) = wallet_with(&[60_000]).await;
        let htlc_spk = ScriptBuf::from_bytes(vec![0x00; 34]);

        let session = wallet.begin().await;
        let prepared = session.prepare(&htlc_spk, 40_000).await.unwrap();
        session.broadcast(&prepared).await.unwrap();
        drop(session);
        assert_eq!(wallet.reserved_count().await, 1);

        chain.spend_coin(&prepared.inputs[0]);
        let session = wallet.begin().await;
        let _ = session.prepare(&htlc_spk, 40_000).await;
        assert_eq!(wallet.reserved_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_fundings_never_share_coins() {
        let (_chain, wallet) = wallet_with(&[30_000, 30_000, 30_000, 30_000]).await;
        let wallet = Arc::new(wallet);
        let htlc_spk = ScriptBuf::from_bytes(vec![0x00; 34]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let wallet = wallet.clone();
            let spk = htlc_spk.clone();
            handles.push(tokio::spawn(async move {
                let session = wallet.begin().await;
                let prepared = session.prepare(&spk, 20_000).await?;
                session.broadcast(&prepared).await?;
                Ok::<_, ResolverError>(prepared.inputs)
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for outpoint in handle.await.unwrap().unwrap() {
                assert!(seen.insert(outpoint));
            }
        }
        assert_eq!(seen.len(), 4);
    }
}
