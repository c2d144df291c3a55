//! logflux agent binary.
//!
//! Tails the configured access log, forwards parsed events to InfluxDB and
//! serves the live status endpoint until interrupted or a fatal error stops
//! the pipeline.

use anyhow::{Context, Result};
use logflux::config::Config;
use logflux::pipeline;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path =
        std::env::var("LOGFLUX_CONFIG").unwrap_or_else(|_| "logflux.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    info!(
        input = %config.input.path,
        status_addr = %config.monitor.status_addr,
        "logflux starting"
    );

    pipeline::run(config, CancellationToken::new()).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
