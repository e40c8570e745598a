//! # Pipeline Node
//!
//! Runs a processing node and provides operator commands.
//!
//! ```bash
//! # Start a node with the default config
//! pipeline-node run
//!
//! # Check a chain definition
//! pipeline-node validate-chain chains/thermostat.yaml
//!
//! # Submit a message and rewind a partition (durable queue only)
//! pipeline-node publish --tenant acme --entity-id d1 --payload '{"temperature": 95}'
//! pipeline-node replay --partition 3 --offset 0
//! ```
//!
//! `RUST_LOG` overrides the configured log level.

use anyhow::Result;
use clap::Parser;
use pipeline::{
    PipelineConfig,
    cli::{Cli, Commands, commands},
    domain::entity::EntityKey
};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Run { node_id } => commands::handle_run_command(config, node_id).await,
        Commands::ValidateChain { file } => commands::handle_validate_chain_command(&config, &file).await,
        Commands::Publish { tenant, entity_type, entity_id, payload, msg_type } => {
            let key = EntityKey::new(tenant, entity_type, entity_id);
            commands::handle_publish_command(&config, key, &msg_type, &payload).await
        }
        Commands::DeadLetters { path } => commands::handle_dead_letters_command(&config, path.as_deref()).await,
        Commands::Replay { partition, offset } => commands::handle_replay_command(&config, partition, offset).await
    }
}
