//! worksync daemon entry point.

mod daemon;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use daemon::Daemon;
use ws_core::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WORKSYNC_CONFIG").ok())
        .unwrap_or_else(|| "worksync.toml".to_string());
    let config = Config::load_or_default(&config_path)?;

    let daemon = Daemon::new(config).await?;
    daemon.run().await
}
