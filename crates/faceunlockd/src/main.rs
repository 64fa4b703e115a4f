use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod server;
mod store;
mod tokens;

use config::Config;
use faceunlock_core::OnnxPipeline;
use server::AppState;
use store::RefStore;
use tokens::EnrollTokens;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "faceunlockd starting");

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    // Load models and the reference database up front (fail-fast)
    let pipeline = OnnxPipeline::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("loading face models")?;
    let store = RefStore::open(&config.db_path, &config.refs_dir)
        .context("opening reference database")?;
    if store.is_empty() {
        tracing::warn!("no faces enrolled yet; every unlock will fail until someone enrolls");
    }

    let engine = engine::spawn_engine(Box::new(pipeline), config.request_timeout)?;
    let state = Arc::new(AppState::new(
        engine,
        store,
        EnrollTokens::new(config.token_ttl),
        config.similarity_threshold,
    ));
    let app = server::router(state, &config);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "faceunlockd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("faceunlockd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
