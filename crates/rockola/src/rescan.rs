//! The rescanner worker.
//!
//! Runs as `rockola rescan` in a subprocess of the server (or by hand).
//! Walks the collection roots, carries noticed times forward from the
//! previous index, and atomically replaces `tracks.json`. The server
//! reloads the index when this process exits successfully.

use anyhow::{Context, Result};
use tracing::info;

use rockoconf::Config;

use crate::trackdb::TrackDb;
use crate::unix_now;

pub fn run(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("cannot create {}", config.home.display()))?;
    let previous = TrackDb::load(&config.home).unwrap_or_default();
    let fresh = TrackDb::scan(config, &previous, unix_now());
    info!(
        tracks = fresh.len(),
        playable = fresh.playable_count(),
        previous = previous.len(),
        "scan complete"
    );
    fresh
        .save(&config.home)
        .context("cannot write track index")?;
    Ok(())
}
