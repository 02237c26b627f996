//! Forkline chain replayer
//!
//! Feeds a recorded JSON-lines stream of block announcements, finality
//! decisions and execution results through the chain manager and logs
//! what the chain made of them.

use std::fs::read_to_string;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use forkline_module_chain_manager::ChainManager;
use tracing::info;

mod replay;

use crate::replay::{parse_commands, Replayer};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["chain-replayer.toml".to_string()])]
    config: Vec<String>,

    /// JSON-lines file of chain commands
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Get arguments and config
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter("info,fjall=warn").init();
    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = builder.add_source(Environment::with_prefix("FORKLINE")).build()?;

    let manager = ChainManager::from_config(&config)?;

    let text = read_to_string(&args.input)
        .with_context(|| format!("Reading replay file {}", args.input.display()))?;
    let commands = parse_commands(&text)?;
    info!(commands = commands.len(), input = %args.input.display(), "Replaying");

    let mut replayer = Replayer::new(manager).await?;
    for (number, command) in commands.iter().enumerate() {
        replayer
            .apply(command)
            .await
            .with_context(|| format!("Command {} ({command:?}) failed", number + 1))?;
    }
    replayer.finish().await
}
