//! Main entry point: wire the store, the feed, the oracle, and the sink into
//! the pipeline engine and run it until interrupted.

use anyhow::Result;
use std::sync::Arc;
use tender_sentinel::config::EngineConfig;
use tender_sentinel::pipeline::{
    HttpRelevanceOracle, PipelineEngine, Store, TelegramSink, ZakupkiFeed,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();
    info!(
        "starting tender-sentinel: feed={}, cadence={}s",
        config.feed_base_url, config.poll_interval_secs
    );

    let store = Store::connect(&config.database_url).await?;
    let feed = Arc::new(ZakupkiFeed::new(&config)?);
    let oracle = Arc::new(HttpRelevanceOracle::new(&config)?);
    let sink = Arc::new(TelegramSink::new(&config)?);

    let engine = PipelineEngine::new(config, store, feed, oracle, sink);
    let shutdown = engine.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            shutdown.shutdown();
        }
    });

    engine.run().await;
    Ok(())
}
