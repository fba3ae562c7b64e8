//! Swap engine wiring discovery, analysis, execution and refunds together

use super::analyzer::{ClaimWindow, Decision, ProfitabilityAnalyzer};
use super::destination::UtxoDestination;
use super::executor::SwapExecutor;
use super::monitor::OrderMonitor;
use super::order::Order;
use super::refund::RefundManager;
use super::retry::RetryPolicy;
use super::scheduler::{ExecutionScheduler, OrderRunner};
use super::state::SwapStatus;
use super::{fail, transition, unix_now};
use crate::chain::{SourceChain, UtxoChain};
use crate::config::Settings;
use crate::error::ResolverResult;
use crate::metrics;
use crate::signing::SigningProvider;
use crate::state::OrderStore;
use crate::utxo::WalletCoordinator;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Queue priority for orders whose HTLC is already funded
const RESUME_PRIORITY: f64 = 1e12;
const ANALYSIS_QUEUE_SIZE: usize = 1024;

/// Swap engine
pub struct SwapEngine {
    store: Arc<dyn OrderStore>,
    source: Arc<dyn SourceChain>,
    analyzer: ProfitabilityAnalyzer,
    scheduler: Arc<ExecutionScheduler>,
    executor: Arc<SwapExecutor>,
    refunds: Arc<RefundManager>,
    scan_interval: Duration,
    scan_window_blocks: u64,
    shutdown: watch::Receiver<bool>,
}

impl SwapEngine {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn OrderStore>,
        source: Arc<dyn SourceChain>,
        chain: Arc<dyn UtxoChain>,
        wallet: Arc<WalletCoordinator>,
        signer: Arc<dyn SigningProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let resolver = &settings.resolver;
        let analyzer = ProfitabilityAnalyzer::new(
            settings.profitability.clone(),
            ClaimWindow::from_settings(settings),
            source.clone(),
            chain.clone(),
            Arc::new(UtxoDestination::new(settings.bitcoin.dust_threshold)),
            RetryPolicy::from_config(resolver),
            Duration::from_millis(resolver.rpc_timeout_ms),
        );
        let scheduler = Arc::new(ExecutionScheduler::new(resolver.max_concurrent_executions));
        let executor = Arc::new(SwapExecutor::new(
            store.clone(),
            source.clone(),
            chain.clone(),
            wallet.clone(),
            signer.clone(),
            settings,
            shutdown.clone(),
        ));
        let refunds = Arc::new(
            RefundManager::new(store.clone(), chain, wallet, signer, settings)
                .with_scheduler(scheduler.clone()),
        );

        Self {
            store,
            source,
            analyzer,
            scheduler,
            executor,
            refunds,
            scan_interval: Duration::from_secs(resolver.scan_interval_secs.max(1)),
            scan_window_blocks: settings.source_chain.scan_window_blocks,
            shutdown,
        }
    }

    pub fn scheduler(&self) -> Arc<ExecutionScheduler> {
        self.scheduler.clone()
    }

    /// Requeue every non-terminal order found in the store
    ///
    /// Discovered orders go back to analysis. Refund-pending orders are
    /// left to the refund manager.
    pub async fn recover(&self, analysis: &mpsc::Sender<Order>) -> ResolverResult<usize> {
        let pending = self.store.list_non_terminal().await?;
        let mut recovered = 0;

        for ctx in pending {
            let order_hash = ctx.order_hash();
            match ctx.status {
                SwapStatus::Discovered => {
                    if analysis.send(ctx.order).await.is_err() {
                        warn!("Analysis stage closed during recovery");
                        break;
                    }
                }
                SwapStatus::Analyzed | SwapStatus::Matched => {
                    let priority = ctx.analysis.as_ref().map(|a| a.priority).unwrap_or(0.0);
                    self.scheduler.enqueue(order_hash, priority).await;
                }
                SwapStatus::HtlcFunded | SwapStatus::ClaimDetected => {
                    self.scheduler.enqueue(order_hash, RESUME_PRIORITY).await;
                }
                _ => continue,
            }
            debug!("Recovered order {} in {}", order_hash, ctx.status);
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} in-flight orders", recovered);
        }
        Ok(recovered)
    }

    /// Analyze one discovered order; deferrals are returned to the caller
    pub async fn analyze_order(&self, order: &Order) -> ResolverResult<Decision> {
        let order_hash = order.order_hash;
        let Some(mut ctx) = self.store.get(&order_hash).await? else {
            return Err(crate::error::ResolverError::OrderNotFound {
                order_hash: order_hash.to_string(),
            });
        };
        if ctx.status != SwapStatus::Discovered {
            debug!("Order {} already past analysis ({})", order_hash, ctx.status);
            return Ok(Decision::Skip {
                reason: format!("already {}", ctx.status),
            });
        }

        let decision = match self.analyzer.analyze(order, unix_now()).await {
            Ok(decision) => decision,
            Err(e) => {
                fail(self.store.as_ref(), &mut ctx, &e).await?;
                return Err(e);
            }
        };
        metrics::record_analysis(decision.label());

        match &decision {
            Decision::Execute(record) => {
                ctx.analysis = Some(record.clone());
                transition(self.store.as_ref(), &mut ctx, SwapStatus::Analyzed).await?;
                self.scheduler.enqueue(order_hash, record.priority).await;
            }
            Decision::Skip { reason } => {
                info!("Skipping order {}: {}", order_hash, reason);
                ctx.last_error = Some(reason.clone());
                transition(self.store.as_ref(), &mut ctx, SwapStatus::Skipped).await?;
            }
            Decision::Defer { after, reason } => {
                info!(
                    "Deferring order {} for {:?}: {}",
                    order_hash, after, reason
                );
            }
        }
        Ok(decision)
    }

    /// Requeue non-terminal orders that stopped short of a resting state,
    /// such as a funding broadcast that failed transiently
    async fn resume_sweep(&self) -> ResolverResult<()> {
        for status in [
            SwapStatus::Analyzed,
            SwapStatus::Matched,
            SwapStatus::HtlcFunded,
            SwapStatus::ClaimDetected,
        ] {
            for ctx in self.store.list_by_status(status).await? {
                let priority = if status.is_funded() {
                    RESUME_PRIORITY
                } else {
                    ctx.analysis.as_ref().map(|a| a.priority).unwrap_or(0.0)
                };
                self.scheduler.enqueue(ctx.order_hash(), priority).await;
            }
        }
        Ok(())
    }

    /// Run every stage until shutdown
    pub async fn run(self: Arc<Self>) -> ResolverResult<()> {
        let (analysis_tx, mut analysis_rx) = mpsc::channel(ANALYSIS_QUEUE_SIZE);

        // the analysis loop below drains the channel recovery fills
        let recovery_handle = {
            let engine = self.clone();
            let tx = analysis_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.recover(&tx).await {
                    error!("Recovery of in-flight orders failed: {}", e);
                }
            })
        };

        let monitor = OrderMonitor::new(
            self.source.clone(),
            self.store.clone(),
            analysis_tx.clone(),
            self.scan_interval,
            self.scan_window_blocks,
        );
        let monitor_handle = {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { monitor.run(shutdown).await })
        };

        let scheduler_handle = {
            let scheduler = self.scheduler.clone();
            let runner: Arc<dyn OrderRunner> = self.executor.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { scheduler.run(runner, shutdown).await })
        };

        let refund_handle = {
            let refunds = self.refunds.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { refunds.run(shutdown).await })
        };

        info!("Swap engine started");
        let mut shutdown = self.shutdown.clone();
        let mut sweep = tokio::time::interval(self.scan_interval);
        sweep.tick().await;

        loop {
            tokio::select! {
                Some(order) = analysis_rx.recv() => {
                    match self.analyze_order(&order).await {
                        Ok(Decision::Defer { after, .. }) => {
                            let tx = analysis_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(after).await;
                                let _ = tx.send(order).await;
                            });
                        }
                        Ok(_) => {}
                        Err(e) => error!("Analysis of order {} failed: {}", order.order_hash, e),
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.resume_sweep().await {
                        warn!("Resume sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutting down swap engine");
                    break;
                }
            }
        }
        drop(analysis_rx);

        for (name, handle) in [
            ("recovery", recovery_handle),
            ("monitor", monitor_handle),
            ("scheduler", scheduler_handle),
            ("refund manager", refund_handle),
        ] {
            if let Err(e) = handle.await {
                error!("Engine task {} panicked: {}", name, e);
            }
        }
        info!("Swap engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryOrderStore;
    use crate::swap::state::ExecutionContext;
    use crate::testing::{
        fake_signer, order, secret_for, settings, FakeSourceChain, FakeUtxoChain,
    };

    struct Harness {
        chain: Arc<FakeUtxoChain>,
        source: Arc<FakeSourceChain>,
        store: Arc<MemoryOrderStore>,
        engine: Arc<SwapEngine>,
        shutdown: watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let mut settings = settings();
        settings.resolver.poll_interval_ms = 10;
        settings.resolver.scan_interval_secs = 1;
        settings.resolver.refund_interval_secs = 1;

        let chain = Arc::new(FakeUtxoChain::new(100));
        let source = Arc::new(FakeSourceChain::new());
        let store = Arc::new(MemoryOrderStore::new());
        let signer = fake_signer();
        let wallet = Arc::new(WalletCoordinator::new(
            chain.clone(),
            signer.clone(),
            settings.bitcoin.wallet_key_path.clone(),
            settings.bitcoin.dust_threshold,
        ));
        let address = wallet.address().await.unwrap();
        let script = wallet.script_pubkey().await.unwrap();
        chain.add_coin(&address, 1, 500_000, script.to_bytes());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::new(SwapEngine::new(
            &settings,
            store.clone(),
            source.clone(),
            chain.clone(),
            wallet,
            signer,
            shutdown_rx,
        ));
        Harness {
            chain,
            source,
            store,
            engine,
            shutdown: shutdown_tx,
        }
    }

    async fn wait_for(store: &MemoryOrderStore, order: &Order, status: SwapStatus) {
        for _ in 0..300 {
            if let Some(ctx) = store.get(&order.order_hash).await.unwrap() {
                if ctx.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("order never reached {}", status);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_funds_once() {
        let h = harness().await;
        h.chain.set_auto_confirm(1);
        h.chain.claim_with(secret_for(1), 1);
        let o = order(1, 5_000);
        h.source.add_scanned(o.clone());

        let handle = tokio::spawn(h.engine.clone().run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.source.push(o.clone());
        h.source.push(o.clone());

        wait_for(&h.store, &o, SwapStatus::Settled).await;
        h.shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(h.store.list_all().await.unwrap().len(), 1);
        assert_eq!(h.chain.broadcast_count(), 1);
        assert_eq!(h.source.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_unprofitable_order_is_skipped() {
        let h = harness().await;
        let o = order(2, 0);
        let ctx = ExecutionContext::new(o.clone());
        h.store.create_if_absent(&ctx).await.unwrap();

        let decision = h.engine.analyze_order(&o).await.unwrap();
        assert_eq!(decision.label(), "skip");

        let ctx = h.store.get(&o.order_hash).await.unwrap().unwrap();
        assert_eq!(ctx.status, SwapStatus::Skipped);
        assert!(ctx.last_error.unwrap().contains("below threshold"));
        assert_eq!(h.engine.scheduler().queue_depth().await, 0);
    }

    #[tokio::test]
    async fn test_profitable_order_is_queued_with_priority() {
        let h = harness().await;
        let o = order(3, 5_000);
        h.store
            .create_if_absent(&ExecutionContext::new(o.clone()))
            .await
            .unwrap();

        assert_eq!(h.engine.analyze_order(&o).await.unwrap().label(), "execute");
        let ctx = h.store.get(&o.order_hash).await.unwrap().unwrap();
        assert_eq!(ctx.status, SwapStatus::Analyzed);
        assert!(ctx.analysis.unwrap().profit > 0);
        assert_eq!(h.engine.scheduler().queue_depth().await, 1);

        // a second analysis does not requeue or re-advance it
        assert_eq!(h.engine.analyze_order(&o).await.unwrap().label(), "skip");
        assert_eq!(h.engine.scheduler().queue_depth().await, 1);
    }

    #[tokio::test]
    async fn test_fee_spike_defers_without_advancing() {
        let h = harness().await;
        h.chain.set_fee_rate(500);
        let o = order(7, 5_000);
        h.store
            .create_if_absent(&ExecutionContext::new(o.clone()))
            .await
            .unwrap();

        assert_eq!(h.engine.analyze_order(&o).await.unwrap().label(), "defer");
        let ctx = h.store.get(&o.order_hash).await.unwrap().unwrap();
        assert_eq!(ctx.status, SwapStatus::Discovered);
        assert_eq!(h.engine.scheduler().queue_depth().await, 0);
    }

    #[tokio::test]
    async fn test_recover_requeues_in_flight_orders() {
        let h = harness().await;

        let discovered = ExecutionContext::new(order(4, 5_000));
        h.store.upsert(&discovered).await.unwrap();

        let mut funded = ExecutionContext::new(order(5, 5_000));
        for next in [SwapStatus::Analyzed, SwapStatus::Matched, SwapStatus::HtlcFunded] {
            funded.advance(next).unwrap();
        }
        h.store.upsert(&funded).await.unwrap();

        let mut settled = ExecutionContext::new(order(6, 5_000));
        settled.advance(SwapStatus::Skipped).unwrap();
        h.store.upsert(&settled).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        assert_eq!(h.engine.recover(&tx).await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap().order_hash, discovered.order_hash());
        assert_eq!(h.engine.scheduler().queue_depth().await, 1);
    }
}
