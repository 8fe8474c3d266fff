//! fleetd — the resource fleet daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleetd.toml
//! fleetd check-config --config /etc/fleet/fleetd.toml
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use fleetd::{FleetConfig, FleetContext};

#[derive(Parser)]
#[command(name = "fleetd", about = "Resource fleet daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry, health monitor and housekeeping until Ctrl-C.
    Run {
        /// Configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse and validate a configuration file, then print it as JSON.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Command::Run { config } => run(config.as_deref()).await,
        Command::CheckConfig { config } => {
            let config = FleetConfig::from_file(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => "info,fleetd=debug,fleet=debug".parse()?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    info!("fleet daemon starting");

    let config = match config_path {
        Some(path) => {
            let config = FleetConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => FleetConfig::default(),
    };
    let status_interval = config.health_settings()?.interval;

    let ctx = FleetContext::from_config(&config).await?;
    ctx.start();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(status_interval) => {
                let snapshot = ctx.core.snapshot();
                debug!(
                    free = snapshot.free,
                    busy = snapshot.busy,
                    down = snapshot.down,
                    configuring = snapshot.configuring,
                    "fleet status"
                );
            }
            result = &mut shutdown => {
                result?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    ctx.shutdown().await;
    info!("fleet daemon stopped");
    Ok(())
}
