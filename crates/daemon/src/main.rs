//! Standalone sync daemon: in-memory stores, background polling, runs until Ctrl-C.

use anyhow::Context;

use tidemark_infra::{Engine, EngineConfig, Stores};
use tidemark_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var("TIDEMARK_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>().unwrap_or_else(|err| {
            eprintln!("{err}; falling back to json");
            LogFormat::Json
        }),
        Err(_) => LogFormat::default(),
    };
    tidemark_observability::init_with(format);

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    tracing::info!(
        workers = config.workers,
        poll_interval_secs = config.poll_interval.as_secs(),
        "configuration loaded"
    );
    if config.google.client_id.is_empty() {
        tracing::warn!("google client id not set; calendar token refresh will fail");
    }

    let engine = Engine::new(config, Stores::in_memory()).context("failed to build engine")?;
    engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    engine.stop().await;
    let snapshot = engine.snapshot();
    tracing::info!(
        active = snapshot.active,
        queued = snapshot.queue_depth,
        "engine stopped"
    );
    Ok(())
}
