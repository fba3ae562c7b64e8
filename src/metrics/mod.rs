//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and heights
//! - Order discovery and analysis decisions
//! - State machine transitions and outcomes
//! - Wallet balance, queue depth and active executions

use crate::error::{ErrorClass, ResolverError, ResolverResult};
use crate::swap::state::SwapStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "resolver_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "resolver_chain_block_height",
        "Last processed block height per chain",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_REORGS: CounterVec = register_counter_vec!(
        "resolver_chain_reorgs_total",
        "Confirmation counts observed going backwards",
        &["chain"]
    ).unwrap();

    // Discovery metrics
    pub static ref ORDERS_SEEN: CounterVec = register_counter_vec!(
        "resolver_orders_seen_total",
        "Order events observed, including duplicates",
        &["chain_id", "source"]
    ).unwrap();

    pub static ref ORDERS_DISCOVERED: CounterVec = register_counter_vec!(
        "resolver_orders_discovered_total",
        "Distinct orders admitted into the store",
        &["chain_id"]
    ).unwrap();

    pub static ref ANALYSIS_DECISIONS: CounterVec = register_counter_vec!(
        "resolver_analysis_decisions_total",
        "Profitability decisions by outcome",
        &["decision"]
    ).unwrap();

    // Execution metrics
    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "resolver_status_transitions_total",
        "Order status transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref FAILURES: CounterVec = register_counter_vec!(
        "resolver_failures_total",
        "Orders marked failed, by error class",
        &["class"]
    ).unwrap();

    pub static ref ANOMALIES: CounterVec = register_counter_vec!(
        "resolver_reconciliation_anomalies_total",
        "Claim/refund races and other reconciliation anomalies",
        &["kind"]
    ).unwrap();

    pub static ref ACTIVE_EXECUTIONS: Gauge = register_gauge!(
        "resolver_active_executions",
        "Orders currently executing"
    ).unwrap();

    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "resolver_queue_depth",
        "Profitable orders waiting for an execution slot"
    ).unwrap();

    pub static ref EXECUTION_LATENCY: HistogramVec = register_histogram_vec!(
        "resolver_execution_latency_seconds",
        "Time from discovery to a terminal outcome",
        &["outcome"],
        vec![30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0, 86400.0]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "resolver_source_transactions_submitted_total",
        "Settlement transactions submitted on the source chain",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "resolver_source_transactions_failed_total",
        "Settlement transactions that exhausted their retries",
        &["chain_id"]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "resolver_wallet_balance_sats",
        "Confirmed wallet balance in satoshis",
        &["chain"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "resolver_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "resolver_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ResolverResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ResolverError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ResolverError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_chain_height(chain: &str, height: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain])
        .set(height as f64);
}

pub fn record_reorg(chain: &str) {
    CHAIN_REORGS.with_label_values(&[chain]).inc();
}

pub fn record_order_seen(chain_id: u64, source: &str) {
    ORDERS_SEEN
        .with_label_values(&[&chain_id.to_string(), source])
        .inc();
}

pub fn record_order_discovered(chain_id: u64) {
    ORDERS_DISCOVERED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_analysis(decision: &str) {
    ANALYSIS_DECISIONS.with_label_values(&[decision]).inc();
}

pub fn record_transition(from: SwapStatus, to: SwapStatus) {
    STATUS_TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_failure(class: ErrorClass) {
    FAILURES
        .with_label_values(&[&format!("{:?}", class).to_lowercase()])
        .inc();
}

pub fn record_anomaly(kind: &str) {
    ANOMALIES.with_label_values(&[kind]).inc();
}

pub fn set_active_executions(count: usize) {
    ACTIVE_EXECUTIONS.set(count as f64);
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn record_execution_latency(outcome: SwapStatus, latency_secs: f64) {
    EXECUTION_LATENCY
        .with_label_values(&[outcome.as_str()])
        .observe(latency_secs);
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn set_wallet_balance(chain: &str, sats: u64) {
    WALLET_BALANCE.with_label_values(&[chain]).set(sats as f64);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
