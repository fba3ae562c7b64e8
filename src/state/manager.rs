//! PostgreSQL order store

use super::{OrderStats, OrderStore};
use crate::config::DatabaseConfig;
use crate::error::{ResolverError, ResolverResult};
use crate::swap::order::OrderHash;
use crate::swap::state::{ExecutionContext, SwapStatus};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// Order store backed by PostgreSQL
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> ResolverResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> ResolverResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_contexts (
                order_hash BYTEA PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                context JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_execution_contexts_status
            ON execution_contexts (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_checkpoints (
                chain_id BIGINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(row: &PgRow) -> ResolverResult<ExecutionContext> {
        let Json(ctx): Json<ExecutionContext> = row.try_get("context")?;
        Ok(ctx)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create_if_absent(&self, ctx: &ExecutionContext) -> ResolverResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_contexts (order_hash, status, context, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_hash) DO NOTHING
            "#,
        )
        .bind(&ctx.order_hash().as_bytes()[..])
        .bind(ctx.status.as_str())
        .bind(Json(ctx))
        .bind(ctx.created_at)
        .bind(ctx.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert(&self, ctx: &ExecutionContext) -> ResolverResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_contexts (order_hash, status, context, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_hash)
            DO UPDATE SET status = $2, context = $3, updated_at = $5
            "#,
        )
        .bind(&ctx.order_hash().as_bytes()[..])
        .bind(ctx.status.as_str())
        .bind(Json(ctx))
        .bind(ctx.created_at)
        .bind(ctx.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, order_hash: &OrderHash) -> ResolverResult<Option<ExecutionContext>> {
        let row = sqlx::query("SELECT context FROM execution_contexts WHERE order_hash = $1")
            .bind(&order_hash.as_bytes()[..])
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn persist_transition(
        &self,
        ctx: &ExecutionContext,
        expected: SwapStatus,
    ) -> ResolverResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE execution_contexts
            SET status = $2, context = $3, updated_at = $4
            WHERE order_hash = $1 AND status = $5
            "#,
        )
        .bind(&ctx.order_hash().as_bytes()[..])
        .bind(ctx.status.as_str())
        .bind(Json(ctx))
        .bind(ctx.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(
                "Persisted order {}: {} -> {}",
                ctx.order_hash(),
                expected,
                ctx.status
            );
            return Ok(());
        }

        match self.get(&ctx.order_hash()).await? {
            Some(_) => Err(ResolverError::ConcurrentModification {
                order_hash: ctx.order_hash().to_string(),
                expected: expected.to_string(),
            }),
            None => Err(ResolverError::OrderNotFound {
                order_hash: ctx.order_hash().to_string(),
            }),
        }
    }

    async fn list_by_status(&self, status: SwapStatus) -> ResolverResult<Vec<ExecutionContext>> {
        let rows = sqlx::query(
            "SELECT context FROM execution_contexts WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn list_all(&self) -> ResolverResult<Vec<ExecutionContext>> {
        let rows = sqlx::query("SELECT context FROM execution_contexts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn list_non_terminal(&self) -> ResolverResult<Vec<ExecutionContext>> {
        let rows = sqlx::query(
            r#"
            SELECT context FROM execution_contexts
            WHERE status NOT IN ('skipped', 'settled', 'refunded', 'failed')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn stats(&self) -> ResolverResult<OrderStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM execution_contexts GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OrderStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count = row.try_get::<i64, _>("count")? as u64;
            stats.total += count;
            stats.by_status.insert(status, count);
        }
        Ok(stats)
    }

    async fn get_checkpoint(&self, chain_id: u64) -> ResolverResult<u64> {
        let row = sqlx::query("SELECT block_number FROM scan_checkpoints WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.get::<i64, _>("block_number") as u64)
            .unwrap_or(0))
    }

    async fn save_checkpoint(&self, chain_id: u64, block_number: u64) -> ResolverResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_checkpoints (chain_id, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for chain {}: block {}", chain_id, block_number);
        Ok(())
    }

    async fn health_check(&self) -> ResolverResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
