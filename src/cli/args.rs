//! CLI argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::entity::EntityType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file (defaults to the platform config directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a processing node and consume until Ctrl-C
    Run {
        /// Overrides node.id from the config
        #[arg(long)]
        node_id: Option<String>
    },
    /// Load and compile a rule chain definition
    ValidateChain {
        #[arg(value_name = "FILE")]
        file: PathBuf
    },
    /// Submit one message to the queue
    Publish {
        #[arg(long)]
        tenant:      String,
        #[arg(long, default_value = "device")]
        entity_type: EntityType,
        #[arg(long)]
        entity_id:   String,
        /// JSON payload
        #[arg(long)]
        payload:     String,
        #[arg(long, default_value = "POST_TELEMETRY_REQUEST")]
        msg_type:    String
    },
    /// Print dead-letter entries as JSON lines
    DeadLetters {
        /// Dead-letter file; defaults to dead_letter_path from the config
        #[arg(long)]
        path: Option<PathBuf>
    },
    /// Move the consumer group of a partition to an offset
    Replay {
        #[arg(long)]
        partition: u32,
        #[arg(long)]
        offset:    u64
    }
}
