//! WolfVote - External Tie-Break Voter
//!
//! Runs a voter for one or more failover stripes, or performs one-shot
//! operator actions against a single server.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfvote::config::{StripeConfig, VoterConfig};
use wolfvote::Voter;

/// WolfVote - External Tie-Break Voter for Failover Stripes
#[derive(Parser)]
#[command(name = "wolfvote")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfvote.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [logging] level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start voting until interrupted
    Start {
        /// Server address (host:port); repeat for each seed
        #[arg(short, long = "server")]
        servers: Vec<String>,

        /// Stripe name for the servers given on the command line
        #[arg(long, default_value = "default")]
        stripe: String,
    },

    /// Cast a single override vote for a server
    Override {
        /// Server address (host:port)
        address: String,
    },

    /// Print a server's state and voter capacity as JSON
    Probe {
        /// Server address (host:port)
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfvote.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = cli
        .log_level
        .clone()
        .or_else(|| configured_log_level(&cli.config))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start { servers, stripe } => run_start(&cli.config, servers, stripe).await,
        Commands::Override { address } => run_override(&cli.config, address).await,
        Commands::Probe { address } => run_probe(&cli.config, address).await,
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Log level from the config file, if one is readable
fn configured_log_level(path: &Path) -> Option<String> {
    VoterConfig::from_file(path)
        .ok()
        .map(|config| config.logging.level)
}

/// Load the config file; a missing file yields defaults unless `required`
fn load_config(path: &Path, required: bool) -> anyhow::Result<VoterConfig> {
    if path.exists() {
        return VoterConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()));
    }
    if required {
        bail!("configuration file {} not found", path.display());
    }
    Ok(VoterConfig::default())
}

/// Run the voter
async fn run_start(config_path: &Path, servers: Vec<String>, stripe: String) -> anyhow::Result<()> {
    let mut config = load_config(config_path, servers.is_empty())?;

    if !servers.is_empty() {
        config.stripes.retain(|existing| existing.name != stripe);
        config.stripes.push(StripeConfig {
            name: stripe,
            servers,
        });
        config.validate()?;
    }
    if config.stripes.is_empty() {
        bail!("no stripes configured; pass --server or add [[stripes]] to the config");
    }

    tracing::info!("Starting WolfVote voter {}", config.voter.id);
    let voter = Voter::new(&config);

    for stripe in &config.stripes {
        let status = voter
            .register(&stripe.name, &stripe.servers)
            .await
            .with_context(|| format!("failed to register stripe {}", stripe.name))?;

        tokio::spawn(async move {
            match status.await_registration_with_all().await {
                Ok(()) => tracing::info!("Registered with every server in stripe {}", status.stripe()),
                Err(e) => tracing::warn!("Stripe {} not fully registered: {}", status.stripe(), e),
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    voter.shutdown().await;
    Ok(())
}

/// Cast one override vote
async fn run_override(config_path: &Path, address: String) -> anyhow::Result<()> {
    let config = load_config(config_path, false)?;
    let voter = Voter::new(&config);

    if voter.override_vote(&address).await? {
        println!("✓ Override vote accepted by {}", address);
        Ok(())
    } else {
        bail!("override vote rejected by {}", address)
    }
}

/// Print what a server reports about itself
async fn run_probe(config_path: &Path, address: String) -> anyhow::Result<()> {
    let mut config = load_config(config_path, false)?;
    config.connection.request_timeout_ms = config.connection.request_timeout_ms.min(5_000);

    let voter = Voter::new(&config);
    let report = voter
        .probe(&address)
        .await
        .with_context(|| format!("failed to probe {}", address))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    let voter_id = uuid::Uuid::new_v4();
    let config_content = format!(
        r#"# WolfVote Configuration
# Generated configuration file

[voter]
id = "{voter_id}"
deregister_on_stop = true

[connection]
name = "wolfvote"
connect_timeout_ms = 10000
request_timeout_ms = 10000

[timing]
heartbeat_interval_ms = 1000
registration_retry_ms = 5000
registration_round_ms = 60000
topology_fetch_interval_ms = 30000
shutdown_grace_ms = 30000

[logging]
level = "info"

[[stripes]]
name = "stripe-1"
servers = ["node-1:9410", "node-2:9410"]
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list the servers of each stripe.");
    println!("Then start with: wolfvote --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match VoterConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Voter ID: {}", config.voter.id);
            println!("  Heartbeat: {} ms", config.timing.heartbeat_interval_ms);
            println!("  Topology Poll: {} ms", config.timing.topology_fetch_interval_ms);
            for stripe in &config.stripes {
                println!("  Stripe {}: {}", stripe.name, stripe.servers.join(", "));
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
