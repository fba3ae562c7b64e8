//! In-process fakes for the chain and signing seams

use crate::chain::{Coin, SourceChain, SpendInfo, UtxoChain};
use crate::config::tests::SAMPLE;
use crate::config::Settings;
use crate::error::{ResolverError, ResolverResult};
use crate::htlc::claim_witness;
use crate::signing::{LocalSigner, SigningProvider};
use crate::swap::destination::UtxoExecutionParams;
use crate::swap::order::{Order, OrderHash};

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Network, Transaction};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Fixed clock for analyzer tests
pub(crate) const NOW: u64 = 1_700_000_000;
/// Far enough out that wall-clock deadline checks never trip
pub(crate) const FAR_EXPIRY: u64 = 4_000_000_000;
pub(crate) const SOURCE_CHAIN_ID: u64 = 11155111;
const SEED: [u8; 32] = [7u8; 32];

pub(crate) fn settings() -> Settings {
    Settings::from_toml(SAMPLE).unwrap()
}

pub(crate) fn secret_for(n: u8) -> [u8; 32] {
    let mut secret = [0x5eu8; 32];
    secret[0] = n;
    secret
}

/// Valid order `n` paying `fee` to the resolver
pub(crate) fn order(n: u8, fee: u64) -> Order {
    let mut hash = [0u8; 32];
    hash[0] = n;
    hash[31] = 0xee;
    Order {
        order_hash: OrderHash(hash),
        maker: format!("0x{:040x}", n),
        source_asset: format!("0x{:040x}", 0xa0),
        source_amount: 1_000_000,
        destination_chain_id: 0,
        destination_execution_params: UtxoExecutionParams {
            recipient_pubkey_hash: [n; 20],
            amount: 50_000,
            timelock_override: None,
        }
        .encode(),
        resolver_fee_amount: fee,
        expiry_time: FAR_EXPIRY,
        hashlock: sha256::Hash::hash(&secret_for(n)).to_byte_array(),
        source_block: 100,
    }
}

pub(crate) fn fake_signer() -> Arc<dyn SigningProvider> {
    Arc::new(LocalSigner::from_seed(&SEED, Network::Regtest).unwrap())
}

#[derive(Default)]
struct UtxoState {
    height: u64,
    time: u64,
    fee_rate: u64,
    /// (owner address, coin)
    coins: Vec<(String, Coin)>,
    spent: HashSet<String>,
    confirmations: HashMap<String, u32>,
    broadcasts: Vec<String>,
    broadcast_txids: HashSet<String>,
    /// outpoint -> spending transaction
    spends: HashMap<String, SpendInfo>,
    /// Claim returned for any output of a transaction we broadcast
    pending_claim: Option<SpendInfo>,
    broadcast_error: Option<bool>,
    auto_confirm: u32,
}

/// Scriptable destination chain
pub(crate) struct FakeUtxoChain {
    state: Mutex<UtxoState>,
}

impl FakeUtxoChain {
    pub(crate) fn new(height: u64) -> Self {
        Self {
            state: Mutex::new(UtxoState {
                height,
                time: NOW,
                fee_rate: 2,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub(crate) fn set_fee_rate(&self, fee_rate: u64) {
        self.state.lock().unwrap().fee_rate = fee_rate;
    }

    pub(crate) fn set_confirmations(&self, txid: &str, confirmations: u32) {
        self.state
            .lock()
            .unwrap()
            .confirmations
            .insert(txid.to_string(), confirmations);
    }

    pub(crate) fn clear_confirmations(&self, txid: &str) {
        self.state.lock().unwrap().confirmations.remove(txid);
    }

    /// Confirmation count given to transactions as they are broadcast
    pub(crate) fn set_auto_confirm(&self, confirmations: u32) {
        self.state.lock().unwrap().auto_confirm = confirmations;
    }

    pub(crate) fn add_coin(&self, address: &str, n: u8, value: u64, script_pubkey: Vec<u8>) {
        let coin = Coin {
            txid: format!("{:02x}{}", n, "c0".repeat(31)),
            vout: 0,
            value,
            script_pubkey,
            confirmations: 6,
        };
        self.state
            .lock()
            .unwrap()
            .coins
            .push((address.to_string(), coin));
    }

    pub(crate) fn spend_coin(&self, outpoint: &str) {
        self.state.lock().unwrap().spent.insert(outpoint.to_string());
    }

    pub(crate) fn broadcast_count(&self) -> usize {
        self.state.lock().unwrap().broadcasts.len()
    }

    pub(crate) fn broadcasts(&self) -> Vec<Transaction> {
        self.state
            .lock()
            .unwrap()
            .broadcasts
            .iter()
            .filter_map(|raw| hex::decode(raw).ok())
            .filter_map(|bytes| bitcoin::consensus::deserialize(&bytes).ok())
            .collect()
    }

    /// Reject future broadcasts; `transient` picks the error class
    pub(crate) fn fail_broadcasts(&self, transient: Option<bool>) {
        self.state.lock().unwrap().broadcast_error = transient;
    }

    /// Have the maker claim any HTLC we fund, revealing `secret`
    pub(crate) fn claim_with(&self, secret: [u8; 32], confirmations: u32) {
        self.state.lock().unwrap().pending_claim = Some(SpendInfo {
            txid: "c1".repeat(32),
            witness: claim_witness(&[0x30; 71], &[0x02; 33], &secret, &[0x63]),
            confirmations,
        });
    }

    /// Forget a broadcast transaction, as a node does when it drops it
    pub(crate) fn evict(&self, txid: &str) {
        let mut state = self.state.lock().unwrap();
        state.confirmations.remove(txid);
        state.spends.retain(|_, spend| spend.txid != txid);
    }

    pub(crate) fn set_spend(&self, txid: &str, vout: u32, spend: SpendInfo) {
        self.state
            .lock()
            .unwrap()
            .spends
            .insert(format!("{}:{}", txid, vout), spend);
    }
}

#[async_trait]
impl UtxoChain for FakeUtxoChain {
    fn name(&self) -> &str {
        "bitcoin"
    }

    fn network(&self) -> Network {
        Network::Regtest
    }

    async fn list_coins(&self, address: &str) -> ResolverResult<Vec<Coin>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .coins
            .iter()
            .filter(|(owner, coin)| owner == address && !state.spent.contains(&coin.outpoint()))
            .map(|(_, coin)| coin.clone())
            .collect())
    }

    async fn estimate_fee_rate(&self) -> ResolverResult<u64> {
        Ok(self.state.lock().unwrap().fee_rate)
    }

    async fn chain_height(&self) -> ResolverResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn chain_time(&self) -> ResolverResult<u64> {
        Ok(self.state.lock().unwrap().time)
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> ResolverResult<String> {
        let bytes = hex::decode(raw_tx_hex)
            .map_err(|e| ResolverError::Transaction(format!("bad hex: {}", e)))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| ResolverError::Transaction(format!("bad transaction: {}", e)))?;

        let mut state = self.state.lock().unwrap();
        if let Some(transient) = state.broadcast_error {
            return Err(ResolverError::BroadcastRejected {
                chain: "bitcoin".to_string(),
                message: "rejected by fake".to_string(),
                transient,
            });
        }

        let txid = tx.compute_txid().to_string();
        let confirmations = state.auto_confirm;
        for input in &tx.input {
            state.spends.insert(
                input.previous_output.to_string(),
                SpendInfo {
                    txid: txid.clone(),
                    witness: input.witness.iter().map(|w| w.to_vec()).collect(),
                    confirmations,
                },
            );
        }
        state.confirmations.insert(txid.clone(), confirmations);
        state.broadcast_txids.insert(txid.clone());
        state.broadcasts.push(raw_tx_hex.to_string());
        Ok(txid)
    }

    async fn get_confirmations(&self, txid: &str) -> ResolverResult<Option<u32>> {
        Ok(self.state.lock().unwrap().confirmations.get(txid).copied())
    }

    async fn find_spend(
        &self,
        txid: &str,
        vout: u32,
        _from_height: u64,
    ) -> ResolverResult<Option<SpendInfo>> {
        let state = self.state.lock().unwrap();
        if let Some(spend) = state.spends.get(&format!("{}:{}", txid, vout)) {
            let mut spend = spend.clone();
            if let Some(confirmations) = state.confirmations.get(&spend.txid) {
                spend.confirmations = *confirmations;
            }
            return Ok(Some(spend));
        }
        if state.broadcast_txids.contains(txid) {
            return Ok(state.pending_claim.clone());
        }
        Ok(None)
    }
}

/// Scriptable source chain
pub(crate) struct FakeSourceChain {
    feed: broadcast::Sender<Order>,
    scanned: Mutex<Vec<Order>>,
    height: AtomicU64,
    locked: AtomicBool,
    completion_fee: AtomicU64,
    completions: Mutex<Vec<(OrderHash, [u8; 32])>>,
}

impl FakeSourceChain {
    pub(crate) fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            feed,
            scanned: Mutex::new(Vec::new()),
            height: AtomicU64::new(1_000),
            locked: AtomicBool::new(true),
            completion_fee: AtomicU64::new(2),
            completions: Mutex::new(Vec::new()),
        }
    }

    /// Deliver an order on the push feed
    pub(crate) fn push(&self, order: Order) {
        let _ = self.feed.send(order);
    }

    /// Make an order visible to the reconciliation scan
    pub(crate) fn add_scanned(&self, order: Order) {
        self.scanned.lock().unwrap().push(order);
    }

    pub(crate) fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    pub(crate) fn set_completion_fee(&self, fee: u64) {
        self.completion_fee.store(fee, Ordering::SeqCst);
    }

    pub(crate) fn completions(&self) -> Vec<(OrderHash, [u8; 32])> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceChain for FakeSourceChain {
    fn chain_id(&self) -> u64 {
        SOURCE_CHAIN_ID
    }

    fn subscribe_orders(&self) -> BoxStream<'static, Order> {
        let rx = self.feed.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(order) => return Some((order, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn scan_orders_since(&self, from_block: u64) -> ResolverResult<Vec<Order>> {
        Ok(self
            .scanned
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.source_block >= from_block)
            .cloned()
            .collect())
    }

    async fn chain_height(&self) -> ResolverResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn is_source_locked(&self, _order: &Order) -> ResolverResult<bool> {
        Ok(self.locked.load(Ordering::SeqCst))
    }

    async fn estimate_completion_fee(&self, _order: &Order) -> ResolverResult<u64> {
        Ok(self.completion_fee.load(Ordering::SeqCst))
    }

    async fn complete_source(&self, order: &Order, secret: &[u8; 32]) -> ResolverResult<String> {
        if !order.verify_secret(secret) {
            return Err(ResolverError::SecretMismatch {
                order_hash: order.order_hash.to_string(),
            });
        }
        self.completions
            .lock()
            .unwrap()
            .push((order.order_hash, *secret));
        Ok(format!("0x{}", order.order_hash.to_hex()))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
