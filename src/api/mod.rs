//! HTTP API for health checks and read-only order status

use crate::chain::{SourceChain, UtxoChain};
use crate::config::ApiConfig;
use crate::error::{ResolverError, ResolverResult};
use crate::metrics;
use crate::state::{OrderStats, OrderStore};
use crate::swap::state::OrderSnapshot;
use crate::swap::{ExecutionScheduler, OrderHash, SwapStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub source: Arc<dyn SourceChain>,
    pub destination: Arc<dyn UtxoChain>,
    pub scheduler: Arc<ExecutionScheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/orders", get(list_orders))
        .route("/orders/:hash", get(get_order))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server until shutdown
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> ResolverResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ResolverError::Config(format!("cannot bind API to {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| ResolverError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: store reachable and both chains answering
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();
    let source_chain = state.source.health_check().await;
    let destination_chain = state.destination.chain_height().await.is_ok();

    metrics::record_chain_health(&state.source.chain_id().to_string(), source_chain);
    metrics::record_chain_health(state.destination.name(), destination_chain);

    let ready = database && source_chain && destination_chain;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessResponse {
            ready,
            database,
            source_chain,
            destination_chain,
        }),
    )
}

#[derive(Debug, Deserialize)]
struct OrdersQuery {
    status: Option<String>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Vec<OrderSnapshot>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            SwapStatus::from_str(raw)
                .map_err(|_| ApiError::BadRequest(format!("unknown status '{}'", raw)))?,
        ),
        None => None,
    };
    let mut orders = state.store.snapshot(status).await?;
    orders.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Json(orders))
}

async fn get_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<OrderSnapshot>, ApiError> {
    let order_hash = OrderHash::from_str(&hash).map_err(ApiError::BadRequest)?;
    match state.store.get(&order_hash).await? {
        Some(ctx) => Ok(Json(ctx.snapshot())),
        None => Err(ApiError::NotFound(order_hash.to_string())),
    }
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let orders = state.store.stats().await?;
    Ok(Json(StatsResponse {
        orders,
        active_executions: state.scheduler.active_count(),
        queue_depth: state.scheduler.queue_depth().await,
    }))
}

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(ResolverError),
}

impl From<ResolverError> for ApiError {
    fn from(err: ResolverError) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (code, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(hash) => (StatusCode::NOT_FOUND, format!("order {} not found", hash)),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (code, Json(ErrorResponse { error })).into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    source_chain: bool,
    destination_chain: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    orders: OrderStats,
    active_executions: usize,
    queue_depth: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryOrderStore;
    use crate::swap::ExecutionContext;
    use crate::testing::{order, FakeSourceChain, FakeUtxoChain};

    async fn state() -> AppState {
        let store = Arc::new(MemoryOrderStore::new());
        let mut skipped = ExecutionContext::new(order(1, 20));
        skipped.advance(SwapStatus::Skipped).unwrap();
        store.upsert(&skipped).await.unwrap();
        store
            .upsert(&ExecutionContext::new(order(2, 20)))
            .await
            .unwrap();

        AppState {
            store,
            source: Arc::new(FakeSourceChain::new()),
            destination: Arc::new(FakeUtxoChain::new(100)),
            scheduler: Arc::new(ExecutionScheduler::new(2)),
        }
    }

    #[tokio::test]
    async fn test_orders_filter_by_status() {
        let state = state().await;

        let Json(all) = list_orders(State(state.clone()), Query(OrdersQuery { status: None }))
            .await
            .ok()
            .unwrap();
        assert_eq!(all.len(), 2);

        let Json(skipped) = list_orders(
            State(state.clone()),
            Query(OrdersQuery {
                status: Some("skipped".to_string()),
            }),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].order_hash, order(1, 20).order_hash);

        let bad = list_orders(
            State(state),
            Query(OrdersQuery {
                status: Some("pending".to_string()),
            }),
        )
        .await;
        assert!(matches!(bad, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_get_order_by_hash() {
        let state = state().await;
        let hash = order(2, 20).order_hash;

        let Json(snapshot) = get_order(State(state.clone()), Path(hash.to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(snapshot.status, SwapStatus::Discovered);

        let missing = get_order(State(state.clone()), Path(order(9, 20).order_hash.to_string())).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));

        let garbage = get_order(State(state), Path("0xzz".to_string())).await;
        assert!(matches!(garbage, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let state = state().await;
        let Json(stats) = get_stats(State(state)).await.ok().unwrap();
        assert_eq!(stats.orders.total, 2);
        assert_eq!(stats.orders.count(SwapStatus::Skipped), 1);
        assert_eq!(stats.queue_depth, 0);
    }
}
