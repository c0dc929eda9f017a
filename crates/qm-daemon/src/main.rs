//! Quartermaster - Main Entry Point

use anyhow::Context;
use qm_engine::{ConfigError, EngineConfig, Quartermaster, TracingSink};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quartermaster v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("QM_CONFIG")
        .unwrap_or_else(|_| "/etc/quartermaster/engine.json".into());

    let config = match EngineConfig::load(&config_path) {
        Ok(config) => config,
        Err(ConfigError::Io(e)) => {
            tracing::warn!(path = %config_path, error = %e, "config not found, using defaults");
            EngineConfig::default()
        }
        Err(e) => return Err(e).with_context(|| format!("loading {config_path}")),
    };

    let qm = Quartermaster::new(config, Arc::new(TracingSink)).context("building engine")?;
    for status in qm.engine.pool_statuses() {
        tracing::info!(pool = %status.id, unit = %status.unit, total = status.total, "pool ready");
    }

    let services = qm.start();

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    services.shutdown().await;
    Ok(())
}
