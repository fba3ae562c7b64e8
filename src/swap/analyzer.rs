//! Profitability and risk scoring for discovered orders

use super::destination::{DestinationAdapter, UtxoExecutionParams};
use super::order::Order;
use super::retry::{with_timeout, RetryPolicy};
use super::state::AnalysisRecord;
use crate::chain::{SourceChain, UtxoChain};
use crate::config::{ProfitabilityConfig, Settings};
use crate::error::ResolverResult;

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Execute(AnalysisRecord),
    Skip { reason: String },
    /// Re-analyze after the given delay
    Defer { after: Duration, reason: String },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Execute(_) => "execute",
            Decision::Skip { .. } => "skip",
            Decision::Defer { .. } => "defer",
        }
    }
}

/// Fee inputs gathered from the chains for one order
#[derive(Debug, Clone, Copy)]
pub struct FeeQuote {
    pub destination_fee: u64,
    pub source_fee: u64,
    pub fee_rate: u64,
}

/// How long the maker may claim on the destination, measured against the
/// source deadline
#[derive(Debug, Clone, Copy)]
pub struct ClaimWindow {
    pub default_timelock_blocks: u32,
    pub block_interval_secs: u64,
    /// Time kept after the timelock to complete the source side
    pub settle_margin_secs: u64,
}

impl ClaimWindow {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_timelock_blocks: settings.bitcoin.htlc_timelock_blocks,
            block_interval_secs: settings.bitcoin.block_interval_secs,
            settle_margin_secs: settings.resolver.expiry_safety_margin_secs,
        }
    }

    pub fn required_secs(&self, params: &UtxoExecutionParams) -> u64 {
        let blocks = params
            .timelock_override
            .unwrap_or(self.default_timelock_blocks) as u64;
        blocks
            .saturating_mul(self.block_interval_secs)
            .saturating_add(self.settle_margin_secs)
    }
}

pub struct ProfitabilityAnalyzer {
    config: ProfitabilityConfig,
    window: ClaimWindow,
    source: Arc<dyn SourceChain>,
    destination_chain: Arc<dyn UtxoChain>,
    adapter: Arc<dyn DestinationAdapter>,
    retry: RetryPolicy,
    rpc_timeout: Duration,
}

impl ProfitabilityAnalyzer {
    pub fn new(
        config: ProfitabilityConfig,
        window: ClaimWindow,
        source: Arc<dyn SourceChain>,
        destination_chain: Arc<dyn UtxoChain>,
        adapter: Arc<dyn DestinationAdapter>,
        retry: RetryPolicy,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            config,
            window,
            source,
            destination_chain,
            adapter,
            retry,
            rpc_timeout,
        }
    }

    /// Gather fee estimates and score the order
    pub async fn analyze(&self, order: &Order, now: u64) -> ResolverResult<Decision> {
        if !self
            .adapter
            .validate_execution_params(&order.destination_execution_params)
        {
            return Ok(Decision::Skip {
                reason: "invalid destination execution params".to_string(),
            });
        }
        if order.time_to_expiry(now).is_none() {
            return Ok(Decision::Skip {
                reason: "order expired".to_string(),
            });
        }

        let fee_rate = self
            .retry
            .run("estimate fee rate", || {
                with_timeout(
                    self.rpc_timeout,
                    "estimate fee rate",
                    self.destination_chain.estimate_fee_rate(),
                )
            })
            .await?;
        let source_fee = self
            .retry
            .run("estimate completion fee", || {
                with_timeout(
                    self.rpc_timeout,
                    "estimate completion fee",
                    self.source.estimate_completion_fee(order),
                )
            })
            .await?;
        let destination_fee = self
            .adapter
            .estimate_execution_cost(&order.destination_execution_params, fee_rate)?;

        let quote = FeeQuote {
            destination_fee,
            source_fee,
            fee_rate,
        };
        self.score(order, quote, now)
    }

    /// Pure scoring step
    ///
    /// `profit = fee - (destination_fee * conversion + source_fee)`,
    /// `risk = w_time * time_risk + w_size * size_risk`.
    pub fn score(&self, order: &Order, quote: FeeQuote, now: u64) -> ResolverResult<Decision> {
        let cfg = &self.config;
        let params = UtxoExecutionParams::parse(&order.destination_execution_params)?;
        let Some(time_to_expiry) = order.time_to_expiry(now) else {
            return Ok(Decision::Skip {
                reason: "order expired".to_string(),
            });
        };

        // a claim late in the timelock must leave time to settle the source
        let window = self.window.required_secs(&params);
        if window >= time_to_expiry {
            return Ok(Decision::Skip {
                reason: format!(
                    "claim window {}s does not fit in {}s before expiry",
                    window, time_to_expiry
                ),
            });
        }

        let capital = params
            .amount
            .saturating_add(order.safety_deposit(cfg.min_safety_deposit_bps));
        if capital > cfg.max_capital_per_order {
            return Ok(Decision::Skip {
                reason: format!(
                    "capital {} exceeds per-order limit {}",
                    capital, cfg.max_capital_per_order
                ),
            });
        }

        let destination_cost =
            (quote.destination_fee as f64 * cfg.destination_fee_conversion).ceil() as i64;
        let cost = destination_cost.saturating_add(quote.source_fee as i64);
        let fee = i64::try_from(order.resolver_fee_amount).unwrap_or(i64::MAX);
        let profit = fee.saturating_sub(cost);

        let time_risk = self.time_risk(time_to_expiry);
        let size_risk = if cfg.max_order_size == 0 {
            1.0
        } else {
            (params.amount as f64 / cfg.max_order_size as f64).min(1.0)
        };
        let risk = cfg.time_risk_weight * time_risk + cfg.size_risk_weight * size_risk;

        debug!(
            "Order {}: profit {} (fee {} - cost {}), risk {:.3} (time {:.3}, size {:.3})",
            order.order_hash, profit, order.resolver_fee_amount, cost, risk, time_risk, size_risk
        );

        if profit < cfg.min_profit_threshold {
            // a fee spike can make a good order look unprofitable for a while
            if quote.fee_rate > cfg.max_fee_rate
                && time_to_expiry > cfg.min_time_to_expiry_secs + cfg.defer_secs
            {
                return Ok(Decision::Defer {
                    after: Duration::from_secs(cfg.defer_secs),
                    reason: format!(
                        "fee rate {} above {} sat/vB",
                        quote.fee_rate, cfg.max_fee_rate
                    ),
                });
            }
            return Ok(Decision::Skip {
                reason: format!(
                    "profit {} below threshold {}",
                    profit, cfg.min_profit_threshold
                ),
            });
        }
        if risk > cfg.max_risk {
            return Ok(Decision::Skip {
                reason: format!("risk {:.3} above limit {:.3}", risk, cfg.max_risk),
            });
        }

        Ok(Decision::Execute(AnalysisRecord {
            profit,
            risk,
            priority: profit as f64 * (1.0 + time_risk),
            destination_fee: quote.destination_fee,
            source_fee: quote.source_fee,
            fee_rate: quote.fee_rate,
        }))
    }

    /// 1 inside the minimum window, falling linearly to 0 over the urgency horizon
    fn time_risk(&self, time_to_expiry: u64) -> f64 {
        let cfg = &self.config;
        if time_to_expiry < cfg.min_time_to_expiry_secs {
            return 1.0;
        }
        if cfg.urgency_horizon_secs == 0 {
            return 0.0;
        }
        let slack = (time_to_expiry - cfg.min_time_to_expiry_secs) as f64;
        (1.0 - slack / cfg.urgency_horizon_secs as f64).clamp(0.0, 1.0)
    }
}
