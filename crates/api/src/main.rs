//! Cronwatch - Main Entry Point

use api::{init_logging, run_server, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("=== cronwatch v{} ===", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    run_server(config).await?;

    Ok(())
}
