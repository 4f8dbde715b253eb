//! iapt CLI
//!
//! Single binary for:
//! - Opening relay tunnels to instance ports
//! - Connecting to instances over SSH through a tunnel
//! - Inspecting transport algorithms and configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iapt::commands::{self, ConnectOptions};
use iapt_core::config::{self, IaptConfig};
use iapt_core::{AlgorithmCategory, Destination, InstanceLocator};

#[derive(Parser)]
#[command(name = "iapt")]
#[command(author, version, about = "Relay tunnels and SSH sessions to VM instances")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level filter (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Instance to reach
#[derive(Args)]
struct Target {
    /// Instance name
    instance: String,

    /// Project containing the instance
    #[arg(long)]
    project: String,

    /// Zone of the instance
    #[arg(long)]
    zone: String,
}

impl Target {
    fn locator(&self) -> InstanceLocator {
        InstanceLocator::new(&self.project, &self.zone, &self.instance)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open a relay tunnel to an instance port on a local endpoint
    Tunnel {
        #[command(flatten)]
        target: Target,
        /// Port on the instance
        #[arg(short, long, default_value_t = 22)]
        port: u16,
    },

    /// Open an authenticated SSH session to an instance through a tunnel
    Connect {
        #[command(flatten)]
        target: Target,
        /// Username to log in as (derived from the account by default)
        #[arg(short, long)]
        user: Option<String>,
        /// SSH port on the instance (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Private key file (a fresh key is generated by default)
        #[arg(short, long)]
        identity: Option<PathBuf>,
        /// Log protocol diagnostics
        #[arg(long)]
        trace: bool,
        /// Print session details as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the SSH algorithms the transport can negotiate
    Algorithms {
        /// Only show one category
        category: Option<Category>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the configuration file
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print one value, e.g. `connection.relay.address`
    Get { key: String },
    /// Show config file path
    Path,
}

#[derive(Clone, Copy, ValueEnum)]
enum Category {
    Kex,
    HostKey,
    Cipher,
    Mac,
    Compression,
}

impl From<Category> for AlgorithmCategory {
    fn from(category: Category) -> Self {
        match category {
            Category::Kex => AlgorithmCategory::Kex,
            Category::HostKey => AlgorithmCategory::HostKey,
            Category::Cipher => AlgorithmCategory::Cipher,
            Category::Mac => AlgorithmCategory::Mac,
            Category::Compression => AlgorithmCategory::Compression,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Tunnel { target, port } => {
            let config = load(&config_path)?;
            let destination = Destination::new(target.locator(), port);
            commands::tunnel_command(&config, destination).await
        }
        Commands::Connect {
            target,
            user,
            port,
            identity,
            trace,
            json,
        } => {
            let config = load(&config_path)?;
            let options = ConnectOptions {
                user,
                port,
                identity,
                trace,
                json,
            };
            commands::connect_command(&config, target.locator(), options).await
        }
        Commands::Algorithms { category } => commands::algorithms_command(category.map(Into::into)),
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&config_path),
            ConfigAction::Init { force } => commands::config_init(&config_path, force),
            ConfigAction::Get { key } => commands::config_get(&load(&config_path)?, &key),
            ConfigAction::Path => {
                commands::config_path(cli.config.as_deref());
                Ok(())
            }
        },
    }
}

fn load(path: &std::path::Path) -> Result<IaptConfig> {
    config::load_or_default(path).with_context(|| format!("Failed to load config from {:?}", path))
}
