use anyhow::{Context, Result};
use faceapi_core::OnnxAnalyzer;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod response;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("faceapid starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        bind = %config.bind_addr,
        workers = config.workers,
        metric = %config.distance_metric,
        "configuration loaded"
    );

    // Fail fast: a missing model file aborts startup.
    let settings = config.analyzer_settings();
    let engine = engine::spawn_engine(config.workers, config.queue_depth, |worker| {
        tracing::info!(worker, "loading models");
        OnnxAnalyzer::load(&settings)
    })
    .context("failed to start inference engine")?;

    let state = Arc::new(routes::AppState {
        engine,
        policy: config.error_policy(),
        metric: config.distance_metric,
    });
    let app = routes::build_router(state, config.body_limit_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "faceapid ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("faceapid shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
