use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod node;
mod sim;

use cli::{Cli, Commands};
use config::{generate_sample_config, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    let result = match cli.command {
        Commands::Run { config } => run_node(config).await,
        Commands::Init { output } => init_config(output),
        Commands::Keygen { output } => generate_keypair(output),
        Commands::Inspect { config } => inspect_state(config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_config(config_path: &Path) -> Result<NodeConfig> {
    info!("Loading configuration from {:?}", config_path);
    if !config_path.exists() {
        error!(
            "Configuration file not found: {:?}. Run 'ordinal init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    }
    NodeConfig::load(config_path)
}

/// Run the simulated committee
async fn run_node(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let node = Node::new(config)?;
    let summary = node.run().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Initialize a new configuration file
fn init_config(output: PathBuf) -> Result<()> {
    info!("Generating sample configuration");

    let config = generate_sample_config();
    config.save(&output)?;

    info!("Configuration saved to {:?}", output);
    let keys = config.keypairs()?;
    for (index, keypair) in keys.iter().enumerate() {
        info!("  Validator {}: {}", index, keypair.public.to_hex());
    }

    println!("\nConfiguration file created: {}", output.display());
    println!("Edit the file to customize the committee.");
    println!("\nTo start the committee, run:");
    println!("  ordinal run --config {}", output.display());

    Ok(())
}

/// Generate a new keypair
fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = ordinal_core::KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}

/// Print the persisted state of every validator
fn inspect_state(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let report = node::inspect(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
