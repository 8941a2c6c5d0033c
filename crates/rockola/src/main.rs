use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rockoconf::Config;
use rockola::server::{self, Jukebox};

/// The Rockola jukebox daemon
///
/// A multi-user networked jukebox: clients connect over TCP or the local
/// socket, authenticate, and manage a shared play queue; audio goes to
/// the configured sink (RTP by default).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the config file (default: /etc/rockola/config, then
    /// ~/.config/rockola/config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rescan the collection roots and rewrite the track index, then exit.
    /// The server runs this as a subprocess for the `rescan` command.
    Rescan,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Some(Commands::Rescan) => rockola::rescan::run(&config),
        None => serve(config, cli.config),
    }
}

/// One thread, one reactor: the whole server is cooperative.
fn serve(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let jukebox = Jukebox::new(config, config_path)?;
        info!(version = env!("CARGO_PKG_VERSION"), "rockola starting");
        server::serve(jukebox).await
    })
}
