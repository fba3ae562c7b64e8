//! EVM source chain: order registry reads, order discovery and settlement

use super::{ChainProvider, OrderListener, SourceChain};
use crate::config::{ResolverConfig, SourceChainConfig};
use crate::error::{ResolverError, ResolverResult};
use crate::events::{decode_order_status, encode_get_order_status, RegistryStatus};
use crate::state::OrderStore;
use crate::swap::order::Order;
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the push feed; slower subscribers lag and rely on the scan
const ORDER_FEED_CAPACITY: usize = 1024;

pub struct EvmSourceChain {
    provider: Arc<ChainProvider>,
    listener: Arc<OrderListener>,
    sender: TransactionSender,
    order_tx: broadcast::Sender<Order>,
    registry: Address,
    fee_unit_wei: U256,
}

impl EvmSourceChain {
    pub async fn new(
        config: SourceChainConfig,
        resolver: &ResolverConfig,
        store: Arc<dyn OrderStore>,
    ) -> ResolverResult<Self> {
        let fee_unit_wei = U256::from(config.fee_unit_wei.max(1));
        let private_key_env = config.private_key_env.clone();
        let max_blocks_per_query = config.max_blocks_per_query;
        let provider = Arc::new(ChainProvider::new(config)?);

        let registry: Address = provider
            .registry_address()
            .parse()
            .map_err(|e| ResolverError::Config(format!("Invalid registry address: {}", e)))?;

        let (order_tx, _) = broadcast::channel(ORDER_FEED_CAPACITY);
        let listener = Arc::new(OrderListener::new(
            provider.clone(),
            order_tx.clone(),
            store,
            Duration::from_millis(resolver.poll_interval_ms),
            max_blocks_per_query,
        )?);

        let sender = TransactionSender::new(
            provider.clone(),
            &private_key_env,
            resolver.max_retries,
            Duration::from_millis(resolver.retry_base_delay_ms),
            Duration::from_millis(resolver.rpc_timeout_ms),
        )
        .await?;

        Ok(Self {
            provider,
            listener,
            sender,
            order_tx,
            registry,
            fee_unit_wei,
        })
    }

    /// Log poller feeding `subscribe_orders`; the caller spawns `listen`
    pub fn listener(&self) -> Arc<OrderListener> {
        self.listener.clone()
    }

    pub fn provider(&self) -> Arc<ChainProvider> {
        self.provider.clone()
    }

    async fn order_status(&self, order: &Order) -> ResolverResult<RegistryStatus> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.registry)
            .data(encode_get_order_status(&order.order_hash))
            .into();
        let output = self.provider.call(&tx).await?;
        decode_order_status(&output)
    }
}

#[async_trait]
impl SourceChain for EvmSourceChain {
    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    fn subscribe_orders(&self) -> BoxStream<'static, Order> {
        let rx = self.order_tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(order) => return Some((order, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Order feed lagged, {} orders left to the scan", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn scan_orders_since(&self, from_block: u64) -> ResolverResult<Vec<Order>> {
        let safe_block = self
            .provider
            .get_block_number()
            .await?
            .saturating_sub(self.provider.confirmation_blocks());
        if from_block > safe_block {
            return Ok(Vec::new());
        }
        debug!(
            "Scanning chain {} blocks {} to {}",
            self.chain_id(),
            from_block,
            safe_block
        );
        self.listener.fetch_range(from_block, safe_block).await
    }

    async fn chain_height(&self) -> ResolverResult<u64> {
        self.provider.get_block_number().await
    }

    async fn is_source_locked(&self, order: &Order) -> ResolverResult<bool> {
        let status = self.order_status(order).await?;
        debug!("Order {} registry status: {:?}", order.order_hash, status);
        Ok(status.is_locked())
    }

    async fn estimate_completion_fee(&self, _order: &Order) -> ResolverResult<u64> {
        let cost_wei = self.sender.estimate_withdraw_cost().await?;
        let (units, rem) = cost_wei.div_mod(self.fee_unit_wei);
        let units = if rem.is_zero() { units } else { units + 1 };
        Ok(units.min(U256::from(u64::MAX)).as_u64())
    }

    async fn complete_source(&self, order: &Order, secret: &[u8; 32]) -> ResolverResult<String> {
        if !order.verify_secret(secret) {
            return Err(ResolverError::SecretMismatch {
                order_hash: order.order_hash.to_string(),
            });
        }
        let tx_hash = self.sender.submit_withdraw(&order.order_hash, secret).await?;
        Ok(format!("{:?}", tx_hash))
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}
