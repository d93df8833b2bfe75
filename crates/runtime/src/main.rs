use anyhow::Context;

use jobforge_runtime::{Runtime, RuntimeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = RuntimeConfig::from_env().context("invalid configuration")?;
    let runtime = Runtime::start(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    runtime.shutdown().await;
    Ok(())
}
