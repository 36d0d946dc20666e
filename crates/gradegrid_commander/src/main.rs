//! Gradegrid Commander
//!
//! Usage:
//!     gradegrid-commander --config commander.conf

use clap::Parser;
use gradegrid_commander::{Commander, CommanderArgs, Hooks};
use gradegrid_protocol::CommanderConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gradegrid_commander=info,gradegrid_fabric=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CommanderArgs::parse();
    let config = CommanderConfig::load(&args.config)?;

    tracing::info!("Starting gradegrid commander");
    tracing::info!("  Base port: {}", config.base_port);
    tracing::info!("  Submissions: {}", config.test_dir.display());
    tracing::info!("  Results: {}", config.results_dir.display());

    let mut commander = Commander::make(config, Hooks::default()).await?;
    let outcome = commander.run().await;
    commander.close().await;
    outcome
}
