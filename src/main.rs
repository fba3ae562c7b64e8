//! HTLC resolver - EVM to UTXO-chain atomic swap execution

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use htlc_resolver::api::{self, AppState};
use htlc_resolver::chain::{BitcoinRpcClient, EvmSourceChain, SourceChain, UtxoChain};
use htlc_resolver::config::{LogFormat, Settings};
use htlc_resolver::metrics::{self, MetricsServer};
use htlc_resolver::signing;
use htlc_resolver::state::{self, OrderStore};
use htlc_resolver::swap::SwapEngine;
use htlc_resolver::utxo::WalletCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;
    init_logging(settings.logging.format);

    info!(
        "Starting HTLC resolver v{} ({})",
        env!("CARGO_PKG_VERSION"),
        settings.resolver.instance_id
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Order store
    let store = state::connect(&settings.database).await?;
    info!("Order store ready");

    // Signing backend and chains
    let network = settings.bitcoin.network.to_network();
    let signer = signing::from_config(&settings.signer, network)?;
    info!("Signing backend: {}", signer.backend());

    let rpc_timeout = Duration::from_millis(settings.resolver.rpc_timeout_ms);
    let destination: Arc<dyn UtxoChain> =
        Arc::new(BitcoinRpcClient::new(&settings.bitcoin, rpc_timeout)?);

    let evm = EvmSourceChain::new(
        settings.source_chain.clone(),
        &settings.resolver,
        store.clone(),
    )
    .await?;
    let listener = evm.listener();
    let source: Arc<dyn SourceChain> = Arc::new(evm);
    info!(
        "Connected to source chain {} and {} destination",
        source.chain_id(),
        destination.name()
    );

    let wallet = Arc::new(WalletCoordinator::new(
        destination.clone(),
        signer.clone(),
        settings.bitcoin.wallet_key_path.clone(),
        settings.bitcoin.dust_threshold,
    ));
    info!("Resolver wallet address: {}", wallet.address().await?);

    let engine = Arc::new(SwapEngine::new(
        &settings,
        store.clone(),
        source.clone(),
        destination.clone(),
        wallet,
        signer,
        shutdown_rx.clone(),
    ));

    // Order registry log poller
    let listener_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = listener.listen(shutdown).await {
                error!("Order listener error: {}", e);
            }
        }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            store: store.clone(),
            source: source.clone(),
            destination: destination.clone(),
            scheduler: engine.scheduler(),
        };
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = api::run_server(config, state, shutdown).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start swap engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Swap engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn(health_loop(
        store.clone(),
        source.clone(),
        destination.clone(),
        Duration::from_secs(settings.resolver.health_check_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));

    info!("HTLC resolver is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(true);

    // In-flight executions resume from the store on the next start
    for (name, handle) in [
        ("engine", engine_handle),
        ("listener", listener_handle),
        ("api", api_handle),
        ("health", health_handle),
    ] {
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("{} did not stop in time", name);
        }
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC resolver stopped");
    Ok(())
}

async fn health_loop(
    store: Arc<dyn OrderStore>,
    source: Arc<dyn SourceChain>,
    destination: Arc<dyn UtxoChain>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let mut healthy = true;

        let source_ok = source.health_check().await;
        metrics::record_chain_health(&source.chain_id().to_string(), source_ok);
        if !source_ok {
            warn!("Source chain {} health check failed", source.chain_id());
            healthy = false;
        }

        match destination.chain_height().await {
            Ok(height) => {
                metrics::record_chain_health(destination.name(), true);
                metrics::record_chain_height(destination.name(), height);
            }
            Err(e) => {
                metrics::record_chain_health(destination.name(), false);
                warn!("{} health check failed: {}", destination.name(), e);
                healthy = false;
            }
        }

        if let Err(e) = store.health_check().await {
            warn!("Order store health check failed: {}", e);
            healthy = false;
        }

        metrics::record_health_check();
        if !healthy {
            metrics::record_health_check_failure();
        }
    }
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,htlc_resolver=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
