//! Timeout refunds of funded HTLCs
//!
//! Runs on its own interval over funded orders, independent of the
//! executors, so an order whose executor died is still either claimed
//! through or refunded.

use super::order::OrderHash;
use super::retry::{with_timeout, RetryPolicy};
use super::scheduler::ExecutionScheduler;
use super::state::{ExecutionContext, HtlcRecord, SwapStatus};
use super::transition;
use crate::chain::{ChainKind, FinalityTracker, UtxoChain};
use crate::config::{HtlcAddressType, Settings};
use crate::error::{ResolverError, ResolverResult};
use crate::htlc::extract_secret;
use crate::metrics;
use crate::signing::SigningProvider;
use crate::state::OrderStore;
use crate::utxo::builder::{sign_refund, unsigned_refund, HTLC_OUTPUT_INDEX};
use crate::utxo::selector::htlc_spend_fee;
use crate::utxo::WalletCoordinator;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::Transaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Absolute lock times at or above this are unix timestamps
const LOCKTIME_THRESHOLD: u64 = 500_000_000;
/// Queue priority for claims found by the refund scan
const CLAIM_PRIORITY: f64 = 1e12;

/// Whether the refund branch of `htlc` is spendable in the next block
pub async fn timelock_elapsed(chain: &dyn UtxoChain, htlc: &HtlcRecord) -> ResolverResult<bool> {
    let timelock = htlc.params.timelock as u64;
    if htlc.params.timelock_is_relative {
        let Some(funded_at) = htlc.funding_height else {
            return Ok(false);
        };
        let tip = chain.chain_height().await?;
        return Ok(tip >= funded_at + timelock);
    }

    if timelock < LOCKTIME_THRESHOLD {
        Ok(chain.chain_height().await? >= timelock)
    } else {
        Ok(chain.chain_time().await? > timelock)
    }
}

pub struct RefundManager {
    store: Arc<dyn OrderStore>,
    chain: Arc<dyn UtxoChain>,
    wallet: Arc<WalletCoordinator>,
    signer: Arc<dyn SigningProvider>,
    /// Claims and refunds both need this depth before they count
    spend_finality: FinalityTracker,
    scheduler: Option<Arc<ExecutionScheduler>>,
    address_type: HtlcAddressType,
    dust_threshold: u64,
    interval: Duration,
    retry: RetryPolicy,
    rpc_timeout: Duration,
}

impl RefundManager {
    pub fn new(
        store: Arc<dyn OrderStore>,
        chain: Arc<dyn UtxoChain>,
        wallet: Arc<WalletCoordinator>,
        signer: Arc<dyn SigningProvider>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            spend_finality: FinalityTracker::new(
                chain.clone(),
                settings.resolver.claim_confirmations,
            ),
            chain,
            wallet,
            signer,
            scheduler: None,
            address_type: settings.bitcoin.htlc_address_type,
            dust_threshold: settings.bitcoin.dust_threshold,
            interval: Duration::from_secs(settings.resolver.refund_interval_secs.max(1)),
            retry: RetryPolicy::from_config(&settings.resolver),
            rpc_timeout: Duration::from_millis(settings.resolver.rpc_timeout_ms),
        }
    }

    /// Hand claims found during the scan to the scheduler for settlement
    pub fn with_scheduler(mut self, scheduler: Arc<ExecutionScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Timelock satisfiable and no claim recorded
    pub async fn can_refund(&self, ctx: &ExecutionContext) -> ResolverResult<bool> {
        if !matches!(
            ctx.status,
            SwapStatus::HtlcFunded | SwapStatus::RefundPending
        ) || ctx.claim_tx_id.is_some()
            || ctx.secret.is_some()
        {
            return Ok(false);
        }
        match &ctx.destination_htlc {
            Some(htlc) if htlc.funding_txid.is_some() => {
                timelock_elapsed(self.chain.as_ref(), htlc).await
            }
            _ => Ok(false),
        }
    }

    /// Signed transaction spending the HTLC back to the wallet
    pub async fn build_refund(&self, ctx: &ExecutionContext) -> ResolverResult<Transaction> {
        let htlc = ctx
            .destination_htlc
            .as_ref()
            .ok_or_else(|| ResolverError::Internal("refund of an order without HTLC".into()))?;
        if !timelock_elapsed(self.chain.as_ref(), htlc).await? {
            return Err(ResolverError::TimelockNotElapsed {
                order_hash: ctx.order_hash().to_string(),
            });
        }

        let fee_rate = with_timeout(
            self.rpc_timeout,
            "estimate fee rate",
            self.chain.estimate_fee_rate(),
        )
        .await?;
        let destination = self.wallet.script_pubkey().await?;
        let mut tx = unsigned_refund(
            htlc,
            &destination,
            htlc_spend_fee(fee_rate),
            self.dust_threshold,
        )?;

        let key = with_timeout(
            self.rpc_timeout,
            "derive refund key",
            self.signer
                .derive_key(ChainKind::Bitcoin, &htlc.refund_key_path),
        )
        .await?;
        sign_refund(
            &mut tx,
            htlc,
            self.address_type,
            self.signer.as_ref(),
            &key.public_key,
        )
        .await?;
        Ok(tx)
    }

    /// One pass over funded orders; returns the number of refunds broadcast
    pub async fn scan_once(&self) -> ResolverResult<usize> {
        let mut broadcast = 0;
        for status in [SwapStatus::HtlcFunded, SwapStatus::RefundPending] {
            for ctx in self.store.list_by_status(status).await? {
                let order_hash = ctx.order_hash();
                match self.process(ctx).await {
                    Ok(true) => broadcast += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Refund check for order {} failed: {}", order_hash, e);
                        self.note_error(&order_hash, &e).await;
                    }
                }
            }
        }
        Ok(broadcast)
    }

    async fn process(&self, mut ctx: ExecutionContext) -> ResolverResult<bool> {
        let Some(mut htlc) = ctx.destination_htlc.clone() else {
            return Ok(false);
        };
        let Some(funding_txid) = htlc.funding_txid.clone() else {
            return Ok(false);
        };
        let vout = htlc.output_index.unwrap_or(HTLC_OUTPUT_INDEX);

        if htlc.funding_height.is_none() {
            match self.chain.get_confirmations(&funding_txid).await? {
                Some(confirmations) if confirmations > 0 => {
                    let tip = self.chain.chain_height().await?;
                    htlc.funding_height = Some(super::confirmed_at(tip, confirmations));
                    ctx.destination_htlc = Some(htlc.clone());
                    ctx.touch();
                    self.store.persist_transition(&ctx, ctx.status).await?;
                }
                // nothing can spend an unconfirmed funding output
                _ => return Ok(false),
            }
        }
        let funding_height = htlc.funding_height.unwrap_or_default();

        let spend = with_timeout(
            self.rpc_timeout,
            "find htlc spend",
            self.chain.find_spend(&funding_txid, vout, funding_height),
        )
        .await?;

        if let Some(spend) = spend {
            if let Some(secret) = extract_secret(&spend.witness, &ctx.order.hashlock) {
                if !self.spend_finality.observe(&spend.txid, spend.confirmations) {
                    debug!(
                        "Claim {} of order {} not final yet ({} confirmations)",
                        spend.txid,
                        ctx.order_hash(),
                        spend.confirmations
                    );
                    return Ok(false);
                }
                if ctx.status == SwapStatus::RefundPending {
                    warn!(
                        "Order {}: maker claim {} confirmed after the refund started",
                        ctx.order_hash(),
                        spend.txid
                    );
                    metrics::record_anomaly("claim_after_refund");
                }
                ctx.record_secret(&secret)?;
                ctx.claim_tx_id = Some(spend.txid.clone());
                transition(self.store.as_ref(), &mut ctx, SwapStatus::ClaimDetected).await?;
                self.spend_finality.forget(&spend.txid);
                if let Some(scheduler) = &self.scheduler {
                    scheduler.enqueue(ctx.order_hash(), CLAIM_PRIORITY).await;
                }
                return Ok(false);
            }

            if ctx.status == SwapStatus::RefundPending {
                // only the refund key can spend without the preimage
                if !self.spend_finality.observe(&spend.txid, spend.confirmations) {
                    debug!(
                        "Refund {} of order {} not final yet ({} confirmations)",
                        spend.txid,
                        ctx.order_hash(),
                        spend.confirmations
                    );
                    return Ok(false);
                }
                info!(
                    "Order {}: refund {} final with {} confirmations",
                    ctx.order_hash(),
                    spend.txid,
                    spend.confirmations
                );
                ctx.refund_tx_id = Some(spend.txid.clone());
                transition(self.store.as_ref(), &mut ctx, SwapStatus::Refunded).await?;
                self.spend_finality.forget(&spend.txid);
                return Ok(false);
            }

            warn!(
                "Order {}: HTLC spent by {} without a secret",
                ctx.order_hash(),
                spend.txid
            );
            metrics::record_anomaly("unknown_spend");
            return Ok(false);
        }

        if !timelock_elapsed(self.chain.as_ref(), &htlc).await? {
            return Ok(false);
        }

        match ctx.status {
            SwapStatus::HtlcFunded => {
                match transition(self.store.as_ref(), &mut ctx, SwapStatus::RefundPending).await {
                    Ok(()) => {}
                    Err(ResolverError::ConcurrentModification { .. }) => {
                        debug!("Order {} moved on before refund", ctx.order_hash());
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
                warn!(
                    "Order {}: timelock elapsed without a claim, refunding",
                    ctx.order_hash()
                );
            }
            SwapStatus::RefundPending => {
                if let Some(refund_txid) = ctx.refund_tx_id.clone() {
                    if self.chain.get_confirmations(&refund_txid).await?.is_some() {
                        debug!(
                            "Order {}: refund {} waiting for inclusion",
                            ctx.order_hash(),
                            refund_txid
                        );
                        return Ok(false);
                    }
                    warn!(
                        "Order {}: refund {} dropped by the node, rebuilding",
                        ctx.order_hash(),
                        refund_txid
                    );
                }
            }
            _ => return Ok(false),
        }

        let tx = self.build_refund(&ctx).await?;
        let raw = serialize_hex(&tx);
        let refund_txid = self
            .retry
            .run("broadcast refund", || {
                with_timeout(
                    self.rpc_timeout,
                    "broadcast refund",
                    self.chain.broadcast(&raw),
                )
            })
            .await?;

        info!(
            "Order {}: broadcast refund {} returning {} sat",
            ctx.order_hash(),
            refund_txid,
            tx.output.first().map(|o| o.value.to_sat()).unwrap_or_default()
        );
        // refunded only once the spend is final; a claim may still win
        ctx.refund_tx_id = Some(refund_txid);
        ctx.touch();
        self.store
            .persist_transition(&ctx, SwapStatus::RefundPending)
            .await?;
        Ok(true)
    }

    async fn note_error(&self, order_hash: &OrderHash, err: &ResolverError) {
        let Ok(Some(mut ctx)) = self.store.get(order_hash).await else {
            return;
        };
        ctx.record_error(err);
        if let Err(e) = self.store.persist_transition(&ctx, ctx.status).await {
            debug!("Could not record refund error for {}: {}", order_hash, e);
        }
        if err.should_alert() {
            error!("Refund of order {} needs attention: {}", order_hash, err);
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Refund manager started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(0) => {}
                        Ok(n) => info!("Broadcast {} refunds", n),
                        Err(e) => warn!("Refund scan failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutting down refund manager");
                    break;
                }
            }
        }
    }
}
