//! ftpsync-rs: keeps a local mirror of the newest file on a VPN-gated FTP
//! store, and keeps both the remote directory and the mirror bounded.
//!
//! A sync run brings up an OpenVPN tunnel, downloads the most recent remote
//! file (resuming partial downloads), deletes the oldest remote file and
//! tears the tunnel down again. `cleanup` trims the local mirror by size.

#![warn(clippy::all)]

mod catalog;
mod cleanup;
mod cli;
mod config;
mod error;
mod remote;
mod retention;
mod session_log;
mod shutdown;
mod status;
mod sync;
mod transfer;
mod tunnel;
mod types;

use std::process::ExitCode;

use clap::Parser;

use cli::Command;
use config::{MirrorConfig, SyncConfig, CLEANUP_LOG_NAME, SYNC_LOG_NAME};
use types::LogLevel;

/// Create the mirror directory and start logging into `log_file`.
fn start_logging(mirror: &MirrorConfig, level: LogLevel) -> anyhow::Result<session_log::SessionLog> {
    std::fs::create_dir_all(&mirror.local_dir).map_err(|e| {
        anyhow::anyhow!(
            "Cannot create local directory {}: {}",
            mirror.local_dir.display(),
            e
        )
    })?;
    session_log::init(&mirror.log_file, level)
}

async fn run_sync(args: cli::SyncArgs, level: LogLevel) -> anyhow::Result<ExitCode> {
    let config = SyncConfig::from_args(args)?;
    let log = start_logging(&config.mirror, level)?;
    tracing::debug!(?config, "Loaded configuration");

    let shutdown = shutdown::install_signal_handler()?;
    match sync::run(&config, &log, &shutdown).await {
        Ok(report) => {
            tracing::debug!(
                listed = report.listed,
                fetched = report.fetched.len(),
                "Sync run finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(sync::SyncError::Interrupted) => Ok(ExitCode::from(130)),
        Err(e) => {
            // Already recorded in the session log.
            eprintln!("Error: {} ({})", e, e.kind());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_cleanup(args: cli::CleanupArgs, level: LogLevel) -> anyhow::Result<ExitCode> {
    let mirror = MirrorConfig::from_args(args.mirror, CLEANUP_LOG_NAME)?;
    let log = start_logging(&mirror, level)?;
    cleanup::run(&mirror, &log).await?;
    Ok(ExitCode::SUCCESS)
}

fn run_status(args: cli::StatusArgs) -> anyhow::Result<ExitCode> {
    let mirror = MirrorConfig::from_args(args.mirror, SYNC_LOG_NAME)?;
    let sync_log = args
        .sync_log
        .map(|p| config::expand_tilde(&p.to_string_lossy()))
        .unwrap_or_else(|| mirror.log_file.clone());
    status::run(&mirror, &sync_log)?;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = cli::Cli::parse();
    let level = cli.log_level;

    let command = match cli.effective_command() {
        Ok(command) => command,
        Err(e) => e.exit(),
    };

    match command {
        Command::Sync(args) => run_sync(args, level).await,
        Command::Cleanup(args) => run_cleanup(args, level).await,
        Command::Status(args) => run_status(args),
    }
}
