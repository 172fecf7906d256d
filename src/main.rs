use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use relayd::config::RelayConfig;
use relayd::relay;

#[derive(Parser)]
#[command(name = "relayd", about = "Rendezvous relay for one daemon and its clients", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Listen address (host:port)
    #[arg(long, env = "RELAYD_LISTEN")]
    listen: Option<String>,

    /// host:port advertised in pairing URLs and dialed by daemons
    #[arg(long, env = "RELAYD_ENDPOINT")]
    relay_endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAYD_LOG")]
    log: Option<String>,

    /// TOML config file, layered beneath CLI/env overrides
    #[arg(long, env = "RELAYD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the relay server (default when no subcommand given).
    Serve,
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RelayConfig::new(
        args.listen.clone(),
        args.relay_endpoint.clone(),
        args.log.clone(),
        args.config.clone(),
    );
    setup_logging(&config.log);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(listen = %config.listen, relay_endpoint = %config.relay_endpoint, "starting relay");
            relay::serve(Arc::new(config))
                .await
                .context("relay server exited with an error")?;
        }
    }

    Ok(())
}
