//! Undertow CLI - playback simulator for the memory storage backend
//!
//! Drives a memory torrent the way a streaming client would: pieces are
//! written ahead of a moving cursor while position events trigger eviction.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Bounded in-memory piece storage for BitTorrent streaming")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full debug log of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("failed to initialize tracing")?;

    commands::handle_command(cli.command).await
}
