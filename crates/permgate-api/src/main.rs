//! permgate server binary
//!
//! Runs the permission check service with its background preloader and
//! exposes `/health` and `/metrics`.
//!
//! # Usage
//!
//! ```bash
//! # With config file (SIGHUP re-reads it)
//! permgate --config config.yaml
//!
//! # With environment variables only
//! PERMGATE_STORAGE__SEED_PATH=seed.json permgate
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use permgate_api::observability::{init_logging, init_metrics, LoggingConfig};
use permgate_api::{create_router, DataStorePermissionSource};
use permgate_server::{AuthzService, ConfigLoadError, ServerConfig};
use permgate_storage::MemoryDataStore;

type MemoryService = AuthzService<DataStorePermissionSource<MemoryDataStore>>;

/// permgate - RBAC permission check service
#[derive(Parser, Debug)]
#[command(name = "permgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

fn load_config(path: Option<&str>) -> Result<ServerConfig, ConfigLoadError> {
    match path {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    init_logging(LoggingConfig::from_settings(&config.logging));
    info!(version = env!("CARGO_PKG_VERSION"), "starting permgate");

    let metrics_state = if config.metrics.enabled {
        let state = init_metrics()?;
        info!(path = %config.metrics.path, "metrics enabled");
        Some(state)
    } else {
        None
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let store = match config.storage.backend.as_str() {
        "memory" => match &config.storage.seed_path {
            Some(path) => {
                info!(%path, "loading seed data into in-memory storage");
                Arc::new(MemoryDataStore::from_seed_file(path).await?)
            }
            None => {
                info!("using empty in-memory storage backend");
                MemoryDataStore::new_shared()
            }
        },
        other => anyhow::bail!("unsupported storage backend: {}", other),
    };

    let source = Arc::new(DataStorePermissionSource::new(store));
    let service = Arc::new(AuthzService::new(source, &config));
    service.start();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let reload_task = tokio::spawn(reload_on_hangup(
        Arc::clone(&service),
        args.config.clone(),
        shutdown_tx.subscribe(),
    ));

    let router = create_router(
        Arc::clone(&service),
        metrics_state
            .as_ref()
            .map(|state| (state.clone(), config.metrics.path.as_str())),
    );

    let result = tokio::select! {
        result = run_http_server(router, addr, shutdown_tx.subscribe()) => {
            if let Err(ref e) = result {
                error!("HTTP server error: {}", e);
            }
            result
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping");
            let _ = shutdown_tx.send(());
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    let _ = reload_task.await;
    service.shutdown().await;
    info!("shutdown complete");
    result
}

/// Run the HTTP server with graceful shutdown.
async fn run_http_server(
    router: axum::Router,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    Ok(())
}

/// Re-reads configuration on SIGHUP and pushes it into the running service.
///
/// An invalid file is logged and ignored; the previous settings stay active.
#[cfg(unix)]
async fn reload_on_hangup(
    service: Arc<MemoryService>,
    config_path: Option<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, config reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                match load_config(config_path.as_deref()) {
                    Ok(config) => {
                        service.apply_settings(&config);
                        info!("configuration reloaded");
                    }
                    Err(e) => warn!(error = %e, "configuration reload rejected"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _service: Arc<MemoryService>,
    _config_path: Option<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let _ = shutdown_rx.recv().await;
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
