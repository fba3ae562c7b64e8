//! In-memory order store for tests and development runs

use super::{OrderStats, OrderStore};
use crate::error::{ResolverError, ResolverResult};
use crate::swap::order::OrderHash;
use crate::swap::state::{ExecutionContext, SwapStatus};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryOrderStore {
    contexts: DashMap<OrderHash, ExecutionContext>,
    checkpoints: DashMap<u64, u64>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create_if_absent(&self, ctx: &ExecutionContext) -> ResolverResult<bool> {
        match self.contexts.entry(ctx.order_hash()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(ctx.clone());
                Ok(true)
            }
        }
    }

    async fn upsert(&self, ctx: &ExecutionContext) -> ResolverResult<()> {
        self.contexts.insert(ctx.order_hash(), ctx.clone());
        Ok(())
    }

    async fn get(&self, order_hash: &OrderHash) -> ResolverResult<Option<ExecutionContext>> {
        Ok(self.contexts.get(order_hash).map(|c| c.clone()))
    }

    async fn persist_transition(
        &self,
        ctx: &ExecutionContext,
        expected: SwapStatus,
    ) -> ResolverResult<()> {
        let order_hash = ctx.order_hash();
        let mut stored =
            self.contexts
                .get_mut(&order_hash)
                .ok_or_else(|| ResolverError::OrderNotFound {
                    order_hash: order_hash.to_string(),
                })?;

        if stored.status != expected {
            return Err(ResolverError::ConcurrentModification {
                order_hash: order_hash.to_string(),
                expected: expected.to_string(),
            });
        }
        *stored = ctx.clone();
        Ok(())
    }

    async fn list_by_status(&self, status: SwapStatus) -> ResolverResult<Vec<ExecutionContext>> {
        let mut out: Vec<_> = self
            .contexts
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn list_all(&self) -> ResolverResult<Vec<ExecutionContext>> {
        let mut out: Vec<_> = self.contexts.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn stats(&self) -> ResolverResult<OrderStats> {
        let mut stats = OrderStats::default();
        for entry in self.contexts.iter() {
            stats.total += 1;
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    async fn get_checkpoint(&self, chain_id: u64) -> ResolverResult<u64> {
        Ok(self.checkpoints.get(&chain_id).map(|b| *b).unwrap_or(0))
    }

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> ResolverResult<()> {
        self.checkpoints.insert(chain_id, block_number);
        Ok(())
    }

    async fn health_check(&self) -> ResolverResult<()> {
        Ok(())
    }
}
