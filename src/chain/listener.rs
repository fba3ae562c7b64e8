//! Registry log polling for newly created orders

use crate::error::ResolverResult;
use crate::events::EventParser;
use crate::state::OrderStore;
use crate::swap::order::Order;

use super::ChainProvider;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Polls the order registry and pushes each parsed order to subscribers
pub struct OrderListener {
    provider: Arc<ChainProvider>,
    parser: EventParser,
    order_tx: broadcast::Sender<Order>,
    store: Arc<dyn OrderStore>,
    poll_interval: Duration,
    max_blocks_per_query: u64,
}

impl OrderListener {
    pub fn new(
        provider: Arc<ChainProvider>,
        order_tx: broadcast::Sender<Order>,
        store: Arc<dyn OrderStore>,
        poll_interval: Duration,
        max_blocks_per_query: u64,
    ) -> ResolverResult<Self> {
        let parser = EventParser::new(provider.registry_address())?;
        Ok(Self {
            provider,
            parser,
            order_tx,
            store,
            poll_interval,
            max_blocks_per_query: max_blocks_per_query.max(1),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    /// Fetch and parse orders in an inclusive block range
    pub async fn fetch_range(&self, from_block: u64, to_block: u64) -> ResolverResult<Vec<Order>> {
        let mut orders = Vec::new();
        let mut start = from_block;
        while start <= to_block {
            let end = std::cmp::min(to_block, start + self.max_blocks_per_query - 1);
            let logs = self
                .provider
                .get_logs(&self.parser.order_filter(start, end))
                .await?;
            for log in &logs {
                match self.parser.parse_log(log) {
                    Ok(Some(order)) => orders.push(order),
                    Ok(None) => {}
                    Err(e) => error!("Failed to parse registry log: {}", e),
                }
            }
            start = end + 1;
        }
        Ok(orders)
    }

    /// Polling loop; runs until `shutdown` flips to true
    pub async fn listen(&self, mut shutdown: watch::Receiver<bool>) -> ResolverResult<()> {
        let chain_id = self.chain_id();
        let confirmations = self.provider.confirmation_blocks();
        let mut last_processed = self.store.get_checkpoint(chain_id).await?;
        if last_processed == 0 {
            // Fresh start: only follow new blocks, the reconciliation scan covers history
            last_processed = self
                .provider
                .get_block_number()
                .await?
                .saturating_sub(confirmations);
        }
        info!(
            "Order listener for chain {} starting after block {}",
            chain_id, last_processed
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once(last_processed, confirmations).await {
                Ok(Some(processed)) => last_processed = processed,
                Ok(None) => {}
                Err(e) => warn!("Order polling failed on chain {}: {}", chain_id, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Order listener for chain {} stopped", chain_id);
        Ok(())
    }

    async fn poll_once(&self, last_processed: u64, confirmations: u64) -> ResolverResult<Option<u64>> {
        let chain_id = self.chain_id();
        let safe_block = self
            .provider
            .get_block_number()
            .await?
            .saturating_sub(confirmations);

        if safe_block <= last_processed {
            return Ok(None);
        }

        let from_block = last_processed + 1;
        let to_block = std::cmp::min(safe_block, from_block + self.max_blocks_per_query - 1);
        debug!(
            "Chain {}: processing blocks {} to {}",
            chain_id, from_block, to_block
        );

        let orders = self.fetch_range(from_block, to_block).await?;
        for order in orders {
            crate::metrics::record_order_seen(chain_id, "push");
            // No receivers is fine, the reconciliation scan still covers it
            let _ = self.order_tx.send(order);
        }

        if let Err(e) = self.store.save_checkpoint(chain_id, to_block).await {
            warn!("Failed to save checkpoint: {}", e);
        }
        crate::metrics::record_blocks_processed(chain_id, to_block);

        Ok(Some(to_block))
    }
}
