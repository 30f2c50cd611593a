mod config;
mod mqtt_table;
mod service;

use anyhow::Context;
use common::{TelemetryGuard, setup_logging};
use config::VisionConfig;
use service::VisionService;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = VisionConfig::from_env()?;

    // The guard installs the subscriber itself when exporting over OTLP.
    let _telemetry = match config.otel_endpoint.as_deref() {
        Some(endpoint) => Some(TelemetryGuard::init("vision", endpoint, config.environment)?),
        None => {
            setup_logging(config.environment);
            None
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    tracing::info!(config = ?config, "Loaded configuration");

    let service = VisionService::new(config).context("Failed to initialize vision service")?;

    tokio::task::spawn_blocking(move || service.run(shutdown))
        .await
        .context("Vision service task failed")?
}
