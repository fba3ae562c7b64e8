//! Swap coordination engine
//!
//! This module provides:
//! - Orders and the per-order execution state machine
//! - Profitability analysis and the destination adapter seam
//! - Discovery, priority scheduling and per-order execution
//! - Timeout refunds and the engine that wires the loops together

pub mod analyzer;
pub mod destination;
pub mod engine;
pub mod executor;
pub mod monitor;
pub mod order;
pub mod refund;
pub mod retry;
pub mod scheduler;
pub mod state;

pub use analyzer::{Decision, ProfitabilityAnalyzer};
pub use destination::{DestinationAdapter, UtxoDestination};
pub use engine::SwapEngine;
pub use executor::SwapExecutor;
pub use monitor::OrderMonitor;
pub use order::{Order, OrderHash};
pub use refund::RefundManager;
pub use retry::RetryPolicy;
pub use scheduler::{ExecutionScheduler, OrderRunner};
pub use state::{ExecutionContext, SwapStatus};

use crate::error::{ResolverError, ResolverResult};
use crate::metrics;
use crate::state::OrderStore;

use chrono::Utc;
use tracing::{error, info, warn};

/// Advance `ctx` and persist it, guarded on the status it moved from
pub(crate) async fn transition(
    store: &dyn OrderStore,
    ctx: &mut ExecutionContext,
    next: SwapStatus,
) -> ResolverResult<()> {
    let prev = ctx.advance(next)?;
    store.persist_transition(ctx, prev).await?;
    metrics::record_transition(prev, next);
    if next.is_terminal() {
        let elapsed = Utc::now() - ctx.created_at;
        metrics::record_execution_latency(next, elapsed.num_milliseconds() as f64 / 1000.0);
    }
    info!("Order {}: {} -> {}", ctx.order_hash(), prev, next);
    Ok(())
}

/// Record `err` and mark the order failed where the state machine allows it
///
/// Funded orders cannot fail; they keep the error and stay with the
/// claim watch and refund path.
pub(crate) async fn fail(
    store: &dyn OrderStore,
    ctx: &mut ExecutionContext,
    err: &ResolverError,
) -> ResolverResult<()> {
    ctx.record_error(err);
    if !ctx.status.can_transition_to(SwapStatus::Failed) {
        warn!(
            "Order {} in {} hit an error, left to the refund path: {}",
            ctx.order_hash(),
            ctx.status,
            err
        );
        return store.persist_transition(ctx, ctx.status).await;
    }

    transition(store, ctx, SwapStatus::Failed).await?;
    metrics::record_failure(err.class());
    if err.should_alert() {
        error!("Order {} failed: {}", ctx.order_hash(), err);
    } else {
        warn!("Order {} failed: {}", ctx.order_hash(), err);
    }
    Ok(())
}

/// Height of the block a transaction with `confirmations` was mined in
pub(crate) fn confirmed_at(tip: u64, confirmations: u32) -> u64 {
    (tip + 1).saturating_sub(confirmations as u64)
}

/// Current unix time in seconds
pub(crate) fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
