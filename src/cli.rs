use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::types::*;

const BIN_NAME: &str = "ftpsync-rs";

#[derive(Parser, Debug)]
#[command(
    name = "ftpsync-rs",
    version,
    about = "Mirror the newest file from a VPN-gated FTP store and enforce retention"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Log level (RUST_LOG overrides this)
    #[arg(long, value_enum, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring up the tunnel, fetch the newest remote file and trim the remote store (default)
    Sync(SyncArgs),
    /// Delete the oldest local file when the mirror exceeds its capacity limit
    Cleanup(CleanupArgs),
    /// Show the last completed sync session and the mirror contents
    Status(StatusArgs),
}

/// Parser used when no subcommand is given: every sync option then comes
/// from the environment or its default.
#[derive(Parser, Debug)]
#[command(name = "ftpsync-rs")]
struct DefaultSync {
    #[command(flatten)]
    args: SyncArgs,
}

impl Cli {
    /// The subcommand to run, falling back to `sync`.
    pub fn effective_command(self) -> Result<Command, clap::Error> {
        match self.command {
            Some(command) => Ok(command),
            None => DefaultSync::try_parse_from([BIN_NAME]).map(|d| Command::Sync(d.args)),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FtpArgs {
    /// FTP server host name or address
    #[arg(long = "host", env = "FTP_HOST")]
    pub host: String,

    /// FTP control port
    #[arg(long = "port", env = "FTP_PORT", default_value_t = 21)]
    pub port: u16,

    /// FTP user name
    #[arg(long = "user", env = "FTP_USER")]
    pub user: String,

    /// FTP password.
    /// WARNING: passing via --password is visible in process listings.
    /// Prefer the FTP_PASS environment variable instead.
    #[arg(long = "password", env = "FTP_PASS", hide_env_values = true)]
    pub password: String,

    /// Remote directory holding the mirrored files
    #[arg(long = "remote-dir", env = "REMOTE_DIR")]
    pub remote_dir: String,

    /// Seconds to wait for the connection and for each server reply
    #[arg(long, env = "FTP_TIMEOUT", default_value_t = 30)]
    pub ftp_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct TunnelArgs {
    /// OpenVPN configuration file
    #[arg(long = "ovpn-config", env = "OVPN_CONFIG")]
    pub ovpn_config: String,

    /// Show the tunnel process output instead of discarding it
    #[arg(
        long,
        env = "DEBUG",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub debug: bool,

    /// Seconds to wait for the tunnel interface to appear
    #[arg(long, env = "TUNNEL_TIMEOUT", default_value_t = 60)]
    pub tunnel_timeout: u64,

    /// Milliseconds between tunnel interface checks
    #[arg(long, env = "TUNNEL_POLL_INTERVAL_MS", default_value_t = 1000, hide = true)]
    pub tunnel_poll_interval_ms: u64,

    /// Interface name prefix that marks a live tunnel
    #[arg(long, env = "TUNNEL_INTERFACE_PREFIX", default_value = "tun")]
    pub tunnel_interface_prefix: String,

    /// Seconds to wait for the tunnel process to exit before killing it
    #[arg(long, env = "TUNNEL_STOP_GRACE", default_value_t = 10)]
    pub tunnel_stop_grace: u64,
}

#[derive(Args, Debug, Clone)]
pub struct MirrorArgs {
    /// Local mirror directory
    #[arg(long = "local-dir", env = "LOCAL_DIR")]
    pub local_dir: String,

    /// Log file (defaults to a per-command file inside the mirror directory)
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Local mirror capacity, in --capacity-unit
    #[arg(long, env = "CAPACITY_LIMIT", default_value_t = 1.0)]
    pub capacity_limit: f64,

    /// Unit of --capacity-limit
    #[arg(long, value_enum, env = "CAPACITY_UNIT", default_value = "tb")]
    pub capacity_unit: CapacityUnit,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub ftp: FtpArgs,

    #[command(flatten)]
    pub tunnel: TunnelArgs,

    #[command(flatten)]
    pub mirror: MirrorArgs,

    /// Seconds between NOOP keep-alives while a transfer runs
    #[arg(long, env = "KEEPALIVE_INTERVAL", default_value_t = 60)]
    pub keepalive_interval: u64,

    /// Disable progress bar
    #[arg(long, env = "NO_PROGRESS_BAR")]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub mirror: MirrorArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub mirror: MirrorArgs,

    /// Sync log to read the last session from (defaults to <local-dir>/ftp_sync.log)
    #[arg(long, env = "SYNC_LOG_FILE")]
    pub sync_log: Option<PathBuf>,
}
