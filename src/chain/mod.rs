//! Chain module - the engine's view of the source and destination chains
//!
//! This module provides:
//! - The `UtxoChain` and `SourceChain` collaborator traits
//! - A bitcoind JSON-RPC client for the destination chain
//! - An EVM source chain with multi-RPC failover and order log polling
//! - Confirmation tracking with reorg detection

pub mod bitcoind;
pub mod evm;
pub mod finality;
pub mod listener;
pub mod provider;

pub use bitcoind::BitcoinRpcClient;
pub use evm::EvmSourceChain;
pub use finality::FinalityTracker;
pub use listener::OrderListener;
pub use provider::{ChainProvider, GasPrice};

use crate::error::ResolverResult;
use crate::swap::order::Order;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain family a key or signature belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Bitcoin,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Evm => f.write_str("evm"),
            ChainKind::Bitcoin => f.write_str("bitcoin"),
        }
    }
}

/// An unspent output owned by the resolver wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    pub confirmations: u32,
}

impl Coin {
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// A transaction spending a watched outpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendInfo {
    pub txid: String,
    pub witness: Vec<Vec<u8>>,
    /// Zero while in the mempool
    pub confirmations: u32,
}

/// Destination UTXO chain
///
/// Every call is a suspension point; implementations apply their own
/// timeout and map transport failures onto transient errors.
#[async_trait]
pub trait UtxoChain: Send + Sync {
    fn name(&self) -> &str;

    fn network(&self) -> bitcoin::Network;

    /// Confirmed coins paying `address`
    async fn list_coins(&self, address: &str) -> ResolverResult<Vec<Coin>>;

    /// Fee rate in sat/vB
    async fn estimate_fee_rate(&self) -> ResolverResult<u64>;

    async fn chain_height(&self) -> ResolverResult<u64>;

    /// Median time past of the tip, unix seconds
    async fn chain_time(&self) -> ResolverResult<u64>;

    /// Broadcast a raw transaction, returning its txid
    async fn broadcast(&self, raw_tx_hex: &str) -> ResolverResult<String>;

    /// `None` if the node does not know the transaction
    async fn get_confirmations(&self, txid: &str) -> ResolverResult<Option<u32>>;

    /// Find a transaction spending `txid:vout`, searching blocks from
    /// `from_height` and then the mempool
    async fn find_spend(
        &self,
        txid: &str,
        vout: u32,
        from_height: u64,
    ) -> ResolverResult<Option<SpendInfo>>;
}

/// Source chain holding the order registry
#[async_trait]
pub trait SourceChain: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Push feed of newly created orders; may drop items
    fn subscribe_orders(&self) -> BoxStream<'static, Order>;

    /// Orders created at or after `from_block`
    async fn scan_orders_since(&self, from_block: u64) -> ResolverResult<Vec<Order>>;

    async fn chain_height(&self) -> ResolverResult<u64>;

    /// Whether the maker's funds for this order are locked and unclaimed
    async fn is_source_locked(&self, order: &Order) -> ResolverResult<bool>;

    /// Estimated fee to complete the source side, in resolver fee units
    async fn estimate_completion_fee(&self, order: &Order) -> ResolverResult<u64>;

    /// Reveal the secret on the source chain and claim the maker's funds
    async fn complete_source(&self, order: &Order, secret: &[u8; 32]) -> ResolverResult<String>;

    async fn health_check(&self) -> bool;
}
