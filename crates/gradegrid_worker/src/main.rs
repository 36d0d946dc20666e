//! Gradegrid Worker
//!
//! Usage:
//!     gradegrid-worker --config worker.conf

use clap::Parser;
use gradegrid_worker::{Worker, WorkerArgs};
use gradegrid_protocol::WorkerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gradegrid_worker=info,gradegrid_fabric=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = WorkerArgs::parse();
    let config = WorkerConfig::load(&args.config)?;

    tracing::info!("Starting gradegrid worker");
    tracing::info!("  Commander: {}:{}", config.remote_ip, config.remote_port);
    tracing::info!("  Workspace: {}", config.test_dir.display());

    let mut worker = Worker::connect(config).await?;
    let outcome = worker.run().await;
    worker.close().await;
    outcome
}
