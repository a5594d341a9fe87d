use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use phoenix_core::PhoenixConfig;
use phoenix_server::{background, build_router, AppState};
use phoenix_store::{MemStore, PgStore, Store};

/// Exit codes: 0 clean shutdown, 1 store unreachable, 2 config error.
#[tokio::main]
async fn main() {
    phoenix_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match PhoenixConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    config.log_summary();

    let store: Arc<dyn Store> = match &config.postgres.pg_url {
        Some(url) => match PgStore::connect(url, config.postgres.max_connections).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("store unreachable: {e}");
                std::process::exit(1);
            }
        },
        None => {
            info!("PG_URL not set; running on the in-memory store (dev mode)");
            Arc::new(MemStore::new())
        }
    };

    let state = AppState::new(config, store);

    // Rebuild the liveness cache before traffic arrives.
    if let Err(e) = state.registry.warm().await {
        error!("store unreachable during warm start: {e}");
        std::process::exit(1);
    }

    background::spawn_all(&state);

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {addr}: {e}");
            std::process::exit(2);
        }
    };
    info!("listening on {addr}");

    let app = build_router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {e}");
        std::process::exit(1);
    }

    info!("shutdown complete");
}

/// Resolves on SIGINT/SIGTERM; axum then stops accepting and drains
/// in-flight requests (long polls included, bounded by their deadlines).
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received; draining for up to 30s");
}
