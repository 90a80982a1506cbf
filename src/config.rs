use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{FtpArgs, MirrorArgs, SyncArgs, TunnelArgs};
use crate::retention::{RetentionPolicy, RetentionScope};

/// Log file written by `sync` when `--log-file` is not given.
pub const SYNC_LOG_NAME: &str = "ftp_sync.log";
/// Log file written by `cleanup` when `--log-file` is not given.
pub const CLEANUP_LOG_NAME: &str = "folder_cleanup.log";

const SYS_NET_DIR: &str = "/sys/class/net";

/// FTP connection settings.
#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub remote_dir: String,
    pub timeout: Duration,
    pub port: u16,
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("remote_dir", &self.remote_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FtpConfig {
    fn from_args(args: FtpArgs) -> Self {
        Self {
            host: args.host,
            user: args.user,
            password: args.password,
            remote_dir: args.remote_dir,
            timeout: Duration::from_secs(args.ftp_timeout.max(1)),
            port: args.port,
        }
    }
}

/// How to launch the tunnel process and how to recognise it is up.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub program: String,
    pub args: Vec<String>,
    pub interface_prefix: String,
    pub net_dir: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub show_output: bool,
}

impl TunnelConfig {
    fn from_args(args: TunnelArgs) -> anyhow::Result<Self> {
        let ovpn_config = expand_tilde(&args.ovpn_config);
        if !ovpn_config.is_file() {
            anyhow::bail!(
                "OpenVPN config path is invalid or does not exist: {}",
                ovpn_config.display()
            );
        }
        Ok(Self {
            program: "sudo".to_string(),
            args: vec![
                "openvpn".to_string(),
                "--config".to_string(),
                ovpn_config.display().to_string(),
            ],
            interface_prefix: args.tunnel_interface_prefix,
            net_dir: PathBuf::from(SYS_NET_DIR),
            timeout: Duration::from_secs(args.tunnel_timeout),
            poll_interval: Duration::from_millis(args.tunnel_poll_interval_ms.max(1)),
            stop_grace: Duration::from_secs(args.tunnel_stop_grace),
            show_output: args.debug,
        })
    }
}

/// Local mirror location, its log file and its capacity policy.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub local_dir: PathBuf,
    pub log_file: PathBuf,
    pub retention: RetentionPolicy,
}

impl MirrorConfig {
    pub fn from_args(args: MirrorArgs, default_log_name: &str) -> anyhow::Result<Self> {
        let local_dir = expand_tilde(&args.local_dir);
        if local_dir.as_os_str().is_empty() {
            anyhow::bail!("--local-dir (LOCAL_DIR) must not be empty");
        }
        let log_file = args
            .log_file
            .map(|p| expand_tilde(&p.to_string_lossy()))
            .unwrap_or_else(|| local_dir.join(default_log_name));
        let capacity_limit = capacity_bytes(args.capacity_limit, args.capacity_unit)?;
        Ok(Self {
            local_dir,
            log_file,
            retention: RetentionPolicy {
                capacity_limit,
                scope: RetentionScope::Local,
            },
        })
    }
}

/// Everything a sync run needs, built once at start-up and passed by
/// reference to each component.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub ftp: FtpConfig,
    pub tunnel: TunnelConfig,
    pub mirror: MirrorConfig,
    pub keepalive_interval: Duration,
    pub no_progress_bar: bool,
}

impl SyncConfig {
    pub fn from_args(args: SyncArgs) -> anyhow::Result<Self> {
        Ok(Self {
            ftp: FtpConfig::from_args(args.ftp),
            tunnel: TunnelConfig::from_args(args.tunnel)?,
            mirror: MirrorConfig::from_args(args.mirror, SYNC_LOG_NAME)?,
            keepalive_interval: Duration::from_secs(args.keepalive_interval.max(1)),
            no_progress_bar: args.no_progress_bar,
        })
    }
}

/// Convert a capacity given in whole or fractional units into bytes.
pub(crate) fn capacity_bytes(value: f64, unit: crate::types::CapacityUnit) -> anyhow::Result<u64> {
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!(
            "Capacity limit must be a positive number, got {} {}",
            value,
            unit.as_str()
        );
    }
    let bytes = value * unit.bytes_per_unit() as f64;
    if bytes >= u64::MAX as f64 {
        anyhow::bail!("Capacity limit {} {} is too large", value, unit.as_str());
    }
    Ok(bytes as u64)
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Whether `name` is a single, plain file name that can be joined onto the
/// mirror directory without escaping it.
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}
