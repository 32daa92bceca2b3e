use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lumetric_core::config::Config;
use lumetric_duckdb::DuckDbBackend;
use lumetric_server::app::create_router;
use lumetric_server::state::AppState;
use lumetric_server::workers;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lumetric=info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config error: {e}"))?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir))?;

    let db_path = format!("{}/lumetric.db", config.data_dir);
    let db = Arc::new(DuckDbBackend::open(&db_path, &config.duckdb_memory_limit)?);
    db.seed_site("site_default", "localhost").await?;

    let port = config.port;
    let state = Arc::new(AppState::new(db, config));

    // Batches spilled during a previous run's outage are re-appended before
    // new traffic arrives; the idempotent store makes duplicates a no-op.
    match state.buffer.replay_dead_letters().await {
        Ok(0) => {}
        Ok(n) => info!(batches = n, "replayed dead-letter batches"),
        Err(e) => error!("dead-letter replay failed: {e}"),
    }

    tokio::spawn(
        state
            .buffer
            .clone()
            .run_flush_loop(state.config.buffer_flush_interval()),
    );
    tokio::spawn(workers::run_session_aggregator(state.clone()));
    tokio::spawn(workers::run_rollup_materializer(state.clone()));
    tokio::spawn(workers::run_retention(state.clone()));

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "Lumetric listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Last chance for buffered events to reach the store before exit.
    state.buffer.flush().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
