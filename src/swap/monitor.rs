//! Order discovery: push feed plus a trailing-window reconciliation scan
//!
//! The store is the dedup authority. An order is emitted only when
//! `create_if_absent` inserts it, so the feed and the scan can both
//! deliver the same order without it reaching analysis twice.

use super::order::Order;
use super::state::ExecutionContext;
use crate::chain::SourceChain;
use crate::error::ResolverResult;
use crate::metrics;
use crate::state::OrderStore;

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct OrderMonitor {
    source: Arc<dyn SourceChain>,
    store: Arc<dyn OrderStore>,
    output: mpsc::Sender<Order>,
    scan_interval: Duration,
    scan_window_blocks: u64,
}

impl OrderMonitor {
    pub fn new(
        source: Arc<dyn SourceChain>,
        store: Arc<dyn OrderStore>,
        output: mpsc::Sender<Order>,
        scan_interval: Duration,
        scan_window_blocks: u64,
    ) -> Self {
        Self {
            source,
            store,
            output,
            scan_interval,
            scan_window_blocks,
        }
    }

    /// Admit an order; returns true if it was new and has been emitted
    pub async fn accept(&self, order: Order) -> ResolverResult<bool> {
        let ctx = ExecutionContext::new(order.clone());
        if !self.store.create_if_absent(&ctx).await? {
            debug!("Order {} already known", order.order_hash);
            return Ok(false);
        }

        info!(
            "Discovered order {} from {} (fee {}, expiry {})",
            order.order_hash, order.maker, order.resolver_fee_amount, order.expiry_time
        );
        metrics::record_order_discovered(self.source.chain_id());

        if self.output.send(order).await.is_err() {
            // stays discovered; recover() picks it up on restart
            warn!("Analysis stage closed, order left in store");
        }
        Ok(true)
    }

    /// Re-scan the trailing window for orders the feed dropped
    pub async fn reconcile(&self) -> ResolverResult<usize> {
        let height = self.source.chain_height().await?;
        let from = height.saturating_sub(self.scan_window_blocks);
        let orders = self.source.scan_orders_since(from).await?;

        let chain_id = self.source.chain_id();
        let mut admitted = 0;
        for order in orders {
            metrics::record_order_seen(chain_id, "scan");
            if self.accept(order).await? {
                admitted += 1;
            }
        }

        if admitted > 0 {
            info!(
                "Reconciliation scan from block {} recovered {} orders",
                from, admitted
            );
        }
        metrics::record_chain_height(&chain_id.to_string(), height);
        Ok(admitted)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Order monitor started on chain {} (window {} blocks)",
            self.source.chain_id(),
            self.scan_window_blocks
        );

        if let Err(e) = self.reconcile().await {
            warn!("Initial reconciliation scan failed: {}", e);
        }

        let chain_id = self.source.chain_id();
        let mut feed = self.source.subscribe_orders();
        let mut feed_open = true;
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                next = feed.next(), if feed_open => match next {
                    Some(order) => {
                        metrics::record_order_seen(chain_id, "feed");
                        if let Err(e) = self.accept(order).await {
                            error!("Failed to admit order: {}", e);
                        }
                    }
                    None => {
                        warn!("Order feed closed, relying on the scan");
                        feed_open = false;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!("Reconciliation scan failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutting down order monitor");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryOrderStore;
    use crate::testing::{order, FakeSourceChain};

    fn monitor(
        source: Arc<FakeSourceChain>,
        store: Arc<MemoryOrderStore>,
    ) -> (OrderMonitor, mpsc::Receiver<Order>) {
        let (tx, rx) = mpsc::channel(16);
        let monitor = OrderMonitor::new(source, store, tx, Duration::from_millis(20), 500);
        (monitor, rx)
    }

    #[tokio::test]
    async fn test_duplicate_delivery_emitted_once() {
        let source = Arc::new(FakeSourceChain::new());
        let store = Arc::new(MemoryOrderStore::new());
        let (monitor, mut rx) = monitor(source.clone(), store.clone());

        assert!(monitor.accept(order(1, 20)).await.unwrap());
        assert!(!monitor.accept(order(1, 20)).await.unwrap());

        // the scan sees the same order again
        source.add_scanned(order(1, 20));
        assert_eq!(monitor.reconcile().await.unwrap(), 0);

        assert_eq!(rx.recv().await.unwrap().order_hash, order(1, 20).order_hash);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_recovers_dropped_feed_items() {
        let source = Arc::new(FakeSourceChain::new());
        let store = Arc::new(MemoryOrderStore::new());
        let (monitor, mut rx) = monitor(source.clone(), store);

        source.add_scanned(order(2, 20));
        source.add_scanned(order(3, 20));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { monitor.run(stop_rx).await });

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|o| o.order_hash);
        assert_eq!(seen[0].order_hash, order(2, 20).order_hash);
        assert_eq!(seen[1].order_hash, order(3, 20).order_hash);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_orders_are_admitted() {
        let source = Arc::new(FakeSourceChain::new());
        let store = Arc::new(MemoryOrderStore::new());
        let (monitor, mut rx) = monitor(source.clone(), store.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { monitor.run(stop_rx).await });

        // give the monitor time to subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.push(order(4, 20));
        source.push(order(4, 20));

        assert_eq!(rx.recv().await.unwrap().order_hash, order(4, 20).order_hash);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(store.get(&order(4, 20).order_hash).await.unwrap().is_some());
    }
}
