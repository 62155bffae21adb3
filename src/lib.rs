//! ChainSentry -- rate-limited anomaly detection for protocol metrics.
//!
//! This crate provides the core library for the detection engine: baseline
//! statistics, the stateless pre-filter, the rate-limited orchestrator, and
//! the deep-analysis escalation path, plus the storage layer and a small
//! read-only API surface.

pub mod analysis;
pub mod api;
pub mod baseline;
pub mod config;
pub mod detect;
pub mod notify;
pub mod scheduler;
pub mod storage;

use crate::analysis::provider::HttpProvider;
use crate::config::Config;
use crate::detect::engine::DetectionEngine;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Build an engine over an open store, using the HTTP reasoning provider.
pub fn build_engine(pool: storage::Pool, config: Config) -> Result<Arc<DetectionEngine>> {
    let provider = Arc::new(HttpProvider::from_config(&config.analysis));
    Ok(Arc::new(DetectionEngine::new(pool, config, provider)?))
}

/// Start the ChainSentry daemon: detection driver plus API server.
pub async fn serve(bind: &str, db_path: &str, config_path: &Path) -> Result<()> {
    // 1. Initialize storage
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(db_path)?;

    // 2. Load config and build the engine
    let config = Config::load(config_path)?;
    let interval = Duration::from_secs(config.scheduler.interval_secs);
    let engine = build_engine(pool.clone(), config)?;

    // 3. Start the detection driver (background task)
    let driver_engine = engine.clone();
    tokio::spawn(async move {
        scheduler::run_detection_loop(driver_engine, interval).await;
    });

    // 4. Start the API server
    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState { pool, engine });

    tracing::info!(%addr, "ChainSentry listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
