//! Simply Servers manager - main entry point

mod bootstrap;

use clap::{Parser, Subcommand};
use ssm_foundation::ManagerConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Host-side manager for per-tenant game server containers
#[derive(Parser, Debug)]
#[command(name = "ssmanager")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (defaults to <config dir>/ssmanager/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot every stored server and serve until Ctrl-C
    Run,
    /// Print the stored servers as JSON
    List,
    /// Validate config, catalog and server records without touching the engine
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let path = match args.config {
        Some(path) => path,
        None => ManagerConfig::default_path()?,
    };
    let config = ManagerConfig::load(&path)?;
    tracing::info!(config = %path.display(), "Config loaded");

    match args.command.unwrap_or(Command::Run) {
        Command::Run => bootstrap::run(config).await,
        Command::List => bootstrap::list(config).await,
        Command::Check => {
            let report = bootstrap::check(&config)?;
            println!("{}", report);
            if report.is_clean() {
                Ok(())
            } else {
                anyhow::bail!("{} invalid server record(s)", report.invalid.len())
            }
        }
    }
}
