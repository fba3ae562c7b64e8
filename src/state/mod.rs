//! Durable order state
//!
//! Handles:
//! - Execution context persistence keyed by order hash
//! - Compare-and-swap status transitions
//! - Scan checkpoints for restart recovery
//! - Operator snapshots and per-status counts

mod manager;
mod memory;

pub use manager::PgOrderStore;
pub use memory::MemoryOrderStore;

use crate::config::DatabaseConfig;
use crate::error::{ResolverError, ResolverResult};
use crate::swap::order::OrderHash;
use crate::swap::state::{ExecutionContext, OrderSnapshot, SwapStatus};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Order counts by status
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

impl OrderStats {
    pub fn count(&self, status: SwapStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Keyed store of every order's execution context
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new context; returns false if the order is already known
    async fn create_if_absent(&self, ctx: &ExecutionContext) -> ResolverResult<bool>;

    async fn upsert(&self, ctx: &ExecutionContext) -> ResolverResult<()>;

    async fn get(&self, order_hash: &OrderHash) -> ResolverResult<Option<ExecutionContext>>;

    /// Write `ctx` only if the stored status still equals `expected`
    async fn persist_transition(
        &self,
        ctx: &ExecutionContext,
        expected: SwapStatus,
    ) -> ResolverResult<()>;

    async fn list_by_status(&self, status: SwapStatus) -> ResolverResult<Vec<ExecutionContext>>;

    async fn list_all(&self) -> ResolverResult<Vec<ExecutionContext>>;

    async fn stats(&self) -> ResolverResult<OrderStats>;

    async fn get_checkpoint(&self, chain_id: u64) -> ResolverResult<u64>;

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> ResolverResult<()>;

    async fn health_check(&self) -> ResolverResult<()>;

    /// Move an order to `next`, rejecting transitions the state machine forbids
    async fn update_status(
        &self,
        order_hash: &OrderHash,
        next: SwapStatus,
    ) -> ResolverResult<ExecutionContext> {
        let mut ctx = self
            .get(order_hash)
            .await?
            .ok_or_else(|| ResolverError::OrderNotFound {
                order_hash: order_hash.to_string(),
            })?;
        let prev = ctx.advance(next)?;
        self.persist_transition(&ctx, prev).await?;
        Ok(ctx)
    }

    async fn list_non_terminal(&self) -> ResolverResult<Vec<ExecutionContext>> {
        let mut out = Vec::new();
        for status in SwapStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            out.extend(self.list_by_status(*status).await?);
        }
        Ok(out)
    }

    /// Read-only export for operators, optionally filtered by status
    async fn snapshot(&self, status: Option<SwapStatus>) -> ResolverResult<Vec<OrderSnapshot>> {
        let contexts = match status {
            Some(status) => self.list_by_status(status).await?,
            None => self.list_all().await?,
        };
        Ok(contexts.iter().map(ExecutionContext::snapshot).collect())
    }
}

/// Open the store selected by the database URL
pub async fn connect(config: &DatabaseConfig) -> ResolverResult<Arc<dyn OrderStore>> {
    if config.is_memory() {
        info!("Using in-memory order store; state will not survive a restart");
        return Ok(Arc::new(MemoryOrderStore::new()));
    }

    let store = PgOrderStore::new(config).await?;
    store.run_migrations().await?;
    Ok(Arc::new(store))
}
