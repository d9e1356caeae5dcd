use anyhow::Context;
use clap::Parser;
use tracing::info;

use virtfs_exporter::cli::Args;
use virtfs_exporter::config::ExporterConfig;
use virtfs_exporter::logging::init_logging;
use virtfs_exporter::services::{ServiceContainer, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads its env fallbacks
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = ExporterConfig::load(&args).context("invalid configuration")?;

    let logging = init_logging(config.log_dir.as_deref(), config.debug)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        uri = %config.libvirt_uri,
        "virtfs-exporter starting"
    );

    let container = ServiceContainer::new(&config)?;
    let cancel = container.cancellation_token();
    logging.start_retention_cleanup(cancel.clone());

    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    container.run().await?;

    info!("virtfs-exporter stopped");
    Ok(())
}
