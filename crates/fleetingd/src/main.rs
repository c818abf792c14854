//! fleetingd daemon - disposable-VM pool manager.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetingd_core::{HostTools, PoolConfig, Provider};

#[derive(Debug, Parser)]
#[command(name = "fleetingd")]
#[command(author, version, about = "Disposable-VM pool manager", long_about = None)]
struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file.
    #[arg(long, global = true, default_value = "/etc/fleetingd/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate the configuration and host tools, then print the provider
    /// identity.
    Preflight,
    /// Run the pool until interrupted, destroying every VM on shutdown.
    Run {
        /// Workers to boot at startup.
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "fleetingd=debug,fleetingd_core=debug,fleetingd_image=debug,fleetingd_net=debug"
    } else {
        "fleetingd=info,fleetingd_core=info,fleetingd_image=info,fleetingd_net=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = PoolConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let provider = Provider::new(config, HostTools::default())?;

    match cli.command {
        Commands::Preflight => preflight(&provider),
        Commands::Run { workers } => run(&provider, workers).await,
    }
}

fn preflight(provider: &Provider) -> Result<()> {
    let info = provider.init()?;

    println!("provider:  {}", info.id);
    println!("version:   {}", info.version);
    println!("capacity:  {} instances", info.max_size);
    println!(
        "disk dir:  {}",
        provider.inventory().config().vm_disk_directory.display()
    );
    println!(
        "egress:    {}",
        provider.inventory().config().egress_interface
    );
    Ok(())
}

async fn run(provider: &Provider, workers: usize) -> Result<()> {
    let info = provider.init()?;
    info!(
        id = info.id,
        version = info.version,
        max_size = info.max_size,
        "provider ready"
    );

    if workers > 0 {
        let (booted, err) = provider.increase(workers).await;
        info!(booted, requested = workers, "initial workers booted");
        if let Some(e) = err {
            error!(error = %e, "initial boot failed, shutting down");
            provider.shutdown().await?;
            return Err(e.into());
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutdown requested, destroying all instances");
    provider.shutdown().await?;
    info!("pool empty, exiting");
    Ok(())
}
