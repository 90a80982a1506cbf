//! VPN tunnel lifecycle: spawn the tunnel process, wait for its network
//! interface, and stop it again.
//!
//! At most one [`TunnelHandle`] exists per run. A shutdown while waiting for
//! the interface stops the process the same way [`TunnelManager::close`]
//! does. `kill_on_drop` is the last resort for a handle dropped on panic; it
//! only reaches the direct child, not a process started through `sudo`.

pub mod error;

pub use error::TunnelError;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;

/// Answers whether a tunnel network interface currently exists.
pub trait LinkProbe: Send + Sync {
    fn tunnel_is_up(&self) -> bool;
}

/// Looks for an interface whose name starts with `prefix` under
/// `/sys/class/net` (or another directory with the same layout).
#[derive(Debug, Clone)]
pub struct SysfsLinkProbe {
    net_dir: PathBuf,
    prefix: String,
}

impl SysfsLinkProbe {
    pub fn new(net_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            net_dir: net_dir.into(),
            prefix: prefix.into(),
        }
    }
}

impl LinkProbe for SysfsLinkProbe {
    fn tunnel_is_up(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(&self.net_dir) else {
            return false;
        };
        entries
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with(&self.prefix))
    }
}

/// Brings connectivity to the remote store up and down. The run driver is
/// written against this so it can be exercised without a real VPN.
#[async_trait::async_trait]
pub trait Tunnel: Send + Sync {
    type Handle: Send;

    /// Returns [`TunnelError::Interrupted`] once `shutdown` fires, after
    /// anything it started has been stopped.
    async fn open(&self, shutdown: &CancellationToken) -> Result<Self::Handle, TunnelError>;

    /// Best-effort; never fails.
    async fn close(&self, handle: Self::Handle);
}

/// A running tunnel process.
#[derive(Debug)]
pub struct TunnelHandle {
    child: Child,
}

impl TunnelHandle {
    /// OS process id, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

pub struct TunnelManager {
    config: TunnelConfig,
    probe: Box<dyn LinkProbe>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    pub fn new(config: &TunnelConfig) -> Self {
        let probe = SysfsLinkProbe::new(&config.net_dir, &config.interface_prefix);
        Self::with_probe(config, Box::new(probe))
    }

    pub fn with_probe(config: &TunnelConfig, probe: Box<dyn LinkProbe>) -> Self {
        Self {
            config: config.clone(),
            probe,
        }
    }

    /// Start the tunnel and block until its interface appears.
    ///
    /// On timeout or shutdown the process is stopped before the error is
    /// returned.
    pub async fn open(&self, shutdown: &CancellationToken) -> Result<TunnelHandle, TunnelError> {
        if shutdown.is_cancelled() {
            return Err(TunnelError::Interrupted);
        }
        tracing::info!("Starting tunnel: {} {}", self.config.program, self.config.args.join(" "));

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.config.show_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = command.spawn().map_err(|source| TunnelError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let mut handle = TunnelHandle { child };

        tracing::info!(
            "Waiting for tunnel interface ({}*)...",
            self.config.interface_prefix
        );
        let deadline = Instant::now() + self.config.timeout;
        let failure = loop {
            if self.probe.tunnel_is_up() {
                tracing::info!("Tunnel ready (pid {})", handle.pid().unwrap_or_default());
                return Ok(handle);
            }
            if let Some(status) = handle.child.try_wait()? {
                return Err(TunnelError::Exited(status));
            }
            if Instant::now() >= deadline {
                break TunnelError::Timeout {
                    prefix: self.config.interface_prefix.clone(),
                    waited: self.config.timeout,
                };
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::warn!("Shutdown requested while waiting for tunnel, stopping it");
                    break TunnelError::Interrupted;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        if let Err(e) = self.terminate(&mut handle.child).await {
            tracing::error!("Failed to stop tunnel: {}", e);
        }
        Err(failure)
    }

    /// Stop the tunnel. Failures are logged, never returned.
    pub async fn close(&self, mut handle: TunnelHandle) {
        tracing::info!("Stopping tunnel...");
        match self.terminate(&mut handle.child).await {
            Ok(status) => tracing::info!("Tunnel stopped ({})", status),
            Err(e) => tracing::error!("Failed to stop tunnel: {}", e),
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) -> Result<ExitStatus, TunnelError> {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("SIGTERM to tunnel process {} failed: {}", pid, e);
            }
        }
        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                tracing::warn!(
                    "Tunnel process did not exit within {}s, killing it",
                    self.config.stop_grace.as_secs()
                );
                child.kill().await?;
                Ok(child.wait().await?)
            }
        }
    }
}

#[async_trait::async_trait]
impl Tunnel for TunnelManager {
    type Handle = TunnelHandle;

    async fn open(&self, shutdown: &CancellationToken) -> Result<TunnelHandle, TunnelError> {
        TunnelManager::open(self, shutdown).await
    }

    async fn close(&self, handle: TunnelHandle) {
        TunnelManager::close(self, handle).await
    }
}
