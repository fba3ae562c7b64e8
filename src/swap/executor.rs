//! Per-order execution: source lock check, HTLC funding, claim watch and
//! source-side settlement
//!
//! Every step reloads the context from the store and writes its result
//! with a compare-and-swap on the status it started from. The funding
//! transaction is persisted before it is broadcast, so a crash between the
//! two is resumed by rebroadcasting the same transaction.

use super::destination::UtxoExecutionParams;
use super::order::{Order, OrderHash};
use super::refund::timelock_elapsed;
use super::retry::{with_timeout, RetryPolicy};
use super::scheduler::OrderRunner;
use super::state::{ExecutionContext, HtlcRecord, SwapStatus};
use super::{confirmed_at, fail, transition, unix_now};
use crate::chain::{ChainKind, FinalityTracker, SourceChain, UtxoChain};
use crate::config::{HtlcAddressType, Settings};
use crate::error::{ResolverError, ResolverResult};
use crate::htlc::{build_script, extract_secret, locking_address, ChainParams, HtlcParams};
use crate::signing::SigningProvider;
use crate::state::OrderStore;
use crate::utxo::builder::HTLC_OUTPUT_INDEX;
use crate::utxo::{PreparedFunding, WalletCoordinator};

use async_trait::async_trait;
use bitcoin::Network;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct SwapExecutor {
    store: Arc<dyn OrderStore>,
    source: Arc<dyn SourceChain>,
    chain: Arc<dyn UtxoChain>,
    wallet: Arc<WalletCoordinator>,
    signer: Arc<dyn SigningProvider>,
    funding_finality: FinalityTracker,
    claim_finality: FinalityTracker,
    network: Network,
    address_type: HtlcAddressType,
    refund_key_prefix: String,
    htlc_timelock_blocks: u32,
    expiry_safety_margin: u64,
    poll_interval: Duration,
    rpc_timeout: Duration,
    settle_timeout: Duration,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl SwapExecutor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        source: Arc<dyn SourceChain>,
        chain: Arc<dyn UtxoChain>,
        wallet: Arc<WalletCoordinator>,
        signer: Arc<dyn SigningProvider>,
        settings: &Settings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let resolver = &settings.resolver;
        let rpc_timeout = Duration::from_millis(resolver.rpc_timeout_ms);
        Self {
            funding_finality: FinalityTracker::new(chain.clone(), resolver.funding_confirmations),
            claim_finality: FinalityTracker::new(chain.clone(), resolver.claim_confirmations),
            store,
            source,
            network: chain.network(),
            chain,
            wallet,
            signer,
            address_type: settings.bitcoin.htlc_address_type,
            refund_key_prefix: settings.bitcoin.refund_key_prefix.clone(),
            htlc_timelock_blocks: settings.bitcoin.htlc_timelock_blocks,
            expiry_safety_margin: resolver.expiry_safety_margin_secs,
            poll_interval: Duration::from_millis(resolver.poll_interval_ms.max(1)),
            rpc_timeout,
            // the sender retries internally and waits for inclusion
            settle_timeout: rpc_timeout * (resolver.max_retries.max(1) + 1) * 2,
            retry: RetryPolicy::from_config(resolver),
            shutdown,
        }
    }

    async fn load(&self, order_hash: &OrderHash) -> ResolverResult<ExecutionContext> {
        self.store
            .get(order_hash)
            .await?
            .ok_or_else(|| ResolverError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })
    }

    /// Drive the order until it settles, fails, or parks waiting on
    /// something outside this executor; returns the status it stopped in
    pub async fn execute(&self, order_hash: &OrderHash) -> ResolverResult<SwapStatus> {
        loop {
            let mut ctx = self.load(order_hash).await?;
            let step = match ctx.status {
                SwapStatus::Analyzed => self.confirm_source_lock(&mut ctx).await,
                SwapStatus::Matched => self.fund(&mut ctx).await,
                SwapStatus::HtlcFunded => self.watch_claim(&mut ctx).await,
                SwapStatus::ClaimDetected => self.settle(&mut ctx).await,
                // analysis pending, refund in progress, or finished
                status => return Ok(status),
            };

            match step {
                Ok(true) => continue,
                Ok(false) => return Ok(self.load(order_hash).await?.status),
                Err(e) => {
                    self.handle_error(order_hash, &e).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn handle_error(&self, order_hash: &OrderHash, err: &ResolverError) -> ResolverResult<()> {
        if let ResolverError::ConcurrentModification { .. } = err {
            debug!("Order {} changed under the executor: {}", order_hash, err);
            return Ok(());
        }

        let mut ctx = self.load(order_hash).await?;
        let funding_recorded = ctx
            .destination_htlc
            .as_ref()
            .is_some_and(|h| h.funding_txid.is_some());

        if funding_recorded && ctx.status == SwapStatus::Matched {
            // the funding may still reach the chain; resume instead of failing
            ctx.record_error(err);
            self.store.persist_transition(&ctx, SwapStatus::Matched).await?;
            if err.is_retryable() {
                warn!("Funding of order {} will be retried: {}", order_hash, err);
            } else {
                error!(
                    "Funding of order {} stuck after broadcast: {}",
                    order_hash, err
                );
            }
            return Ok(());
        }

        fail(self.store.as_ref(), &mut ctx, err).await
    }

    /// Too close to the source deadline to start or resume funding
    fn check_deadline(&self, order: &Order) -> ResolverResult<()> {
        if unix_now() + self.expiry_safety_margin >= order.expiry_time {
            return Err(ResolverError::DeadlineExceeded {
                order_hash: order.order_hash.to_string(),
            });
        }
        Ok(())
    }

    /// analyzed -> matched once the maker's source funds are confirmed locked
    async fn confirm_source_lock(&self, ctx: &mut ExecutionContext) -> ResolverResult<bool> {
        let order = ctx.order.clone();
        self.check_deadline(&order)?;

        let locked = self
            .retry
            .run("check source lock", || {
                with_timeout(
                    self.rpc_timeout,
                    "check source lock",
                    self.source.is_source_locked(&order),
                )
            })
            .await?;
        if !locked {
            return Err(ResolverError::Reconciliation {
                order_hash: order.order_hash.to_string(),
                message: "maker funds are not locked on the source chain".to_string(),
            });
        }

        transition(self.store.as_ref(), ctx, SwapStatus::Matched).await?;
        Ok(true)
    }

    /// matched -> htlc_funded
    async fn fund(&self, ctx: &mut ExecutionContext) -> ResolverResult<bool> {
        if ctx
            .destination_htlc
            .as_ref()
            .is_some_and(|h| h.funding_txid.is_some())
        {
            return self.resume_funding(ctx).await;
        }
        self.check_deadline(&ctx.order)?;

        let order_hash = ctx.order_hash();
        let params = UtxoExecutionParams::parse(&ctx.order.destination_execution_params)?;
        let refund_key_path = format!("{}/{}", self.refund_key_prefix, order_hash.key_index());
        let refund_key = with_timeout(
            self.rpc_timeout,
            "derive refund key",
            self.signer.derive_key(ChainKind::Bitcoin, &refund_key_path),
        )
        .await?;

        let htlc_params = HtlcParams {
            hashlock: ctx.order.hashlock,
            timelock: params
                .timelock_override
                .unwrap_or(self.htlc_timelock_blocks),
            timelock_is_relative: true,
            recipient_pubkey_hash: params.recipient_pubkey_hash,
            refund_pubkey_hash: refund_key.public_key_hash,
        };
        let script = build_script(&htlc_params)?;
        let locking = locking_address(
            &script,
            ChainParams {
                network: self.network,
                address_type: self.address_type,
            },
        )?;

        let session = self.wallet.begin().await;
        // the wallet lock can be held by other fundings for a while
        self.check_deadline(&ctx.order)?;
        let prepared = self
            .retry
            .run("prepare funding", || {
                session.prepare(&locking.script_pubkey, params.amount)
            })
            .await?;

        ctx.destination_htlc = Some(HtlcRecord {
            params: htlc_params,
            script_hex: hex::encode(&script),
            locking_address: locking.address.clone(),
            refund_key_path,
            value: params.amount,
            funding_txid: Some(prepared.txid.clone()),
            funding_tx_hex: Some(prepared.tx_hex.clone()),
            output_index: Some(prepared.output_index),
            funding_height: None,
            funding_inputs: prepared.inputs.clone(),
        });
        ctx.touch();
        self.store
            .persist_transition(ctx, SwapStatus::Matched)
            .await?;
        info!(
            "Order {}: funding {} pays {} sat to {} (fee {} sat)",
            order_hash, prepared.txid, params.amount, locking.address, prepared.fee
        );

        let broadcast = self
            .retry
            .run("broadcast funding", || {
                with_timeout(
                    self.rpc_timeout,
                    "broadcast funding",
                    session.broadcast(&prepared),
                )
            })
            .await;
        drop(session);

        match broadcast {
            Ok(_) => {}
            Err(e) if !e.is_retryable() => {
                // refused outright, nothing reached the network
                fail(self.store.as_ref(), ctx, &e).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        transition(self.store.as_ref(), ctx, SwapStatus::HtlcFunded).await?;
        Ok(true)
    }

    /// Reconcile a persisted funding transaction after a crash or a
    /// transient broadcast failure
    async fn resume_funding(&self, ctx: &mut ExecutionContext) -> ResolverResult<bool> {
        let htlc = ctx
            .destination_htlc
            .clone()
            .ok_or_else(|| ResolverError::Internal("funding without HTLC record".into()))?;
        let txid = htlc.funding_txid.clone().unwrap_or_default();

        let known = with_timeout(
            self.rpc_timeout,
            "funding confirmations",
            self.chain.get_confirmations(&txid),
        )
        .await?;

        if known.is_none() {
            let tx_hex = htlc.funding_tx_hex.clone().ok_or_else(|| {
                ResolverError::Internal(format!("funding {} has no stored transaction", txid))
            })?;
            let prepared = PreparedFunding {
                txid: txid.clone(),
                tx_hex,
                output_index: htlc.output_index.unwrap_or(HTLC_OUTPUT_INDEX),
                inputs: htlc.funding_inputs.clone(),
                fee: 0,
            };
            let session = self.wallet.begin().await;
            if let Err(e) = self.check_deadline(&ctx.order) {
                warn!(
                    "Order {}: deadline passed before funding {} reached the node, abandoning it",
                    ctx.order_hash(),
                    txid
                );
                session.abandon(&prepared).await;
                drop(session);
                fail(self.store.as_ref(), ctx, &e).await?;
                return Ok(false);
            }
            info!("Order {}: rebroadcasting funding {}", ctx.order_hash(), txid);
            self.retry
                .run("rebroadcast funding", || {
                    with_timeout(
                        self.rpc_timeout,
                        "rebroadcast funding",
                        session.broadcast(&prepared),
                    )
                })
                .await?;
        } else {
            info!(
                "Order {}: funding {} already known to the node",
                ctx.order_hash(),
                txid
            );
        }

        transition(self.store.as_ref(), ctx, SwapStatus::HtlcFunded).await?;
        Ok(true)
    }

    /// htlc_funded -> claim_detected, polling until the maker claims or the
    /// timelock hands the order to the refund manager
    async fn watch_claim(&self, ctx: &mut ExecutionContext) -> ResolverResult<bool> {
        let order_hash = ctx.order_hash();
        let mut shutdown = self.shutdown.clone();

        loop {
            let mut htlc = ctx
                .destination_htlc
                .clone()
                .ok_or_else(|| ResolverError::Internal("funded order without HTLC".into()))?;
            let txid = htlc.funding_txid.clone().unwrap_or_default();
            let vout = htlc.output_index.unwrap_or(HTLC_OUTPUT_INDEX);

            if htlc.funding_height.is_none() {
                let confirmations = with_timeout(
                    self.rpc_timeout,
                    "funding confirmations",
                    self.funding_finality.confirmations(&txid),
                )
                .await?;
                match confirmations {
                    Some(c) if c >= self.funding_finality.required() => {
                        let tip = self.chain.chain_height().await?;
                        htlc.funding_height = Some(confirmed_at(tip, c));
                        ctx.destination_htlc = Some(htlc.clone());
                        ctx.touch();
                        self.store
                            .persist_transition(ctx, SwapStatus::HtlcFunded)
                            .await?;
                        self.funding_finality.forget(&txid);
                        info!(
                            "Order {}: funding {} final at height {}",
                            order_hash,
                            txid,
                            confirmed_at(tip, c)
                        );
                    }
                    Some(c) => debug!("Funding {} has {} confirmations", txid, c),
                    None => warn!("Funding {} of order {} unknown to the node", txid, order_hash),
                }
            }

            if let Some(from_height) = htlc.funding_height {
                let spend = with_timeout(
                    self.rpc_timeout,
                    "find htlc spend",
                    self.chain.find_spend(&txid, vout, from_height),
                )
                .await?;

                if let Some(spend) = spend {
                    match extract_secret(&spend.witness, &ctx.order.hashlock) {
                        Some(secret) => {
                            if self.claim_finality.observe(&spend.txid, spend.confirmations) {
                                ctx.record_secret(&secret)?;
                                ctx.claim_tx_id = Some(spend.txid.clone());
                                transition(self.store.as_ref(), ctx, SwapStatus::ClaimDetected)
                                    .await?;
                                self.claim_finality.forget(&spend.txid);
                                return Ok(true);
                            }
                            debug!(
                                "Order {}: claim {} seen with {} confirmations",
                                order_hash, spend.txid, spend.confirmations
                            );
                        }
                        None => {
                            debug!(
                                "Order {}: HTLC spent by {} without a secret",
                                order_hash, spend.txid
                            );
                            return Ok(false);
                        }
                    }
                }

                if timelock_elapsed(self.chain.as_ref(), &htlc).await? {
                    info!(
                        "Order {}: timelock elapsed, leaving it to the refund manager",
                        order_hash
                    );
                    return Ok(false);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => return Ok(false),
            }

            *ctx = self.load(&order_hash).await?;
            match ctx.status {
                SwapStatus::HtlcFunded => {}
                // the refund scan found the claim first
                SwapStatus::ClaimDetected => return Ok(true),
                _ => return Ok(false),
            }
        }
    }

    /// claim_detected -> settled
    async fn settle(&self, ctx: &mut ExecutionContext) -> ResolverResult<bool> {
        let secret = ctx.secret_bytes().ok_or_else(|| {
            ResolverError::Internal(format!("order {} has no recorded secret", ctx.order_hash()))
        })?;
        let order = ctx.order.clone();

        let settlement = self
            .retry
            .run("complete source", || {
                with_timeout(
                    self.settle_timeout,
                    "complete source",
                    self.source.complete_source(&order, &secret),
                )
            })
            .await?;

        info!(
            "Order {}: completed source side in {}",
            order.order_hash, settlement
        );
        ctx.settlement_tx_id = Some(settlement);
        transition(self.store.as_ref(), ctx, SwapStatus::Settled).await?;
        Ok(true)
    }
}

#[async_trait]
impl OrderRunner for SwapExecutor {
    async fn run_order(&self, order_hash: OrderHash) {
        match self.execute(&order_hash).await {
            Ok(status) => debug!("Order {} stopped in {}", order_hash, status),
            Err(e) => debug!("Order {} stopped on error: {}", order_hash, e),
        }
    }
}
