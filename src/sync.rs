//! One synchronization run: tunnel up, list, fetch the newest file, trim
//! the remote directory, tunnel down. The whole run is bracketed by the
//! session markers.

use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::catalog::{self, Connector, FtpConnector, RemoteEntry};
use crate::config::SyncConfig;
use crate::error::ErrorKind;
use crate::remote::{RemoteError, RemoteStore};
use crate::retention::{self, Eviction, RetentionPolicy};
use crate::session_log::{SessionLog, SessionOutcome};
use crate::transfer::{self, Outcome, TransferOptions};
use crate::tunnel::{Tunnel, TunnelError, TunnelManager};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Could not connect to FTP server: {0}")]
    Connect(RemoteError),

    #[error("Could not list remote directory: {0}")]
    Listing(RemoteError),

    #[error("Session log write failed: {0}")]
    Log(#[from] std::io::Error),

    #[error("Interrupted by shutdown signal")]
    Interrupted,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalToRun
    }
}

/// What a run did.
#[derive(Debug, Default)]
pub struct RunReport {
    pub listed: usize,
    pub fetched: Vec<(String, Outcome)>,
    pub eviction: Option<Eviction>,
}

/// Everything the run steps need besides the tunnel and the connector.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub local_dir: PathBuf,
    pub transfer: TransferOptions,
    pub remote_retention: RetentionPolicy,
}

impl RunOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            local_dir: config.mirror.local_dir.clone(),
            transfer: TransferOptions {
                keepalive_interval: config.keepalive_interval,
                no_progress_bar: config.no_progress_bar,
            },
            remote_retention: RetentionPolicy::remote(),
        }
    }
}

/// Run one sync against the real tunnel and FTP server.
pub async fn run(
    config: &SyncConfig,
    log: &SessionLog,
    shutdown: &CancellationToken,
) -> Result<RunReport, SyncError> {
    let tunnel = TunnelManager::new(&config.tunnel);
    let connector = FtpConnector::new(&config.ftp);
    run_with(&tunnel, &connector, log, &RunOptions::from_config(config), shutdown).await
}

/// Run one sync. Once the begin marker is written the end marker is written
/// too, whatever happens in between.
pub async fn run_with<T: Tunnel, C: Connector>(
    tunnel: &T,
    connector: &C,
    log: &SessionLog,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<RunReport, SyncError> {
    let session = log.begin()?;

    let result = with_tunnel(tunnel, connector, log, options, shutdown).await;
    let outcome = match &result {
        Ok(_) => SessionOutcome::Completed,
        Err(SyncError::Interrupted) => SessionOutcome::Interrupted,
        Err(e) => SessionOutcome::Failed {
            kind: e.kind(),
            reason: e.to_string(),
        },
    };

    log.end(session, outcome)?;
    result
}

/// Race `fut` against the shutdown token.
async fn until_shutdown<F: Future>(
    shutdown: &CancellationToken,
    fut: F,
) -> Result<F::Output, SyncError> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(SyncError::Interrupted),
        out = fut => Ok(out),
    }
}

async fn with_tunnel<T: Tunnel, C: Connector>(
    tunnel: &T,
    connector: &C,
    log: &SessionLog,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<RunReport, SyncError> {
    // The tunnel watches the token itself so it can stop what it started.
    let handle = match tunnel.open(shutdown).await {
        Ok(handle) => handle,
        Err(TunnelError::Interrupted) => return Err(SyncError::Interrupted),
        Err(e) => {
            tracing::error!("{}", e);
            return Err(e.into());
        }
    };

    let result = with_connection(connector, log, options, shutdown).await;
    tunnel.close(handle).await;
    result
}

async fn with_connection<C: Connector>(
    connector: &C,
    log: &SessionLog,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<RunReport, SyncError> {
    let store = match until_shutdown(shutdown, connector.connect()).await? {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("FTP connection failed: {}", e);
            return Err(SyncError::Connect(e));
        }
    };

    let result = sync_directory(store.as_ref(), log, options, shutdown).await;
    match store.quit().await {
        Ok(()) => tracing::info!("FTP session closed"),
        Err(e) => tracing::warn!("FTP QUIT failed: {}", e),
    }
    result
}

async fn sync_directory(
    store: &dyn RemoteStore,
    log: &SessionLog,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<RunReport, SyncError> {
    let entries = match until_shutdown(shutdown, catalog::list(store)).await? {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Remote listing failed: {}", e);
            return Err(SyncError::Listing(e));
        }
    };
    log.check()?;

    let mut report = RunReport {
        listed: entries.len(),
        ..RunReport::default()
    };
    let Some(newest) = entries.last() else {
        log.event(Level::INFO, "Remote directory is empty, nothing to download")?;
        return Ok(report);
    };

    let targets: &[RemoteEntry] = if entries.len() == 1 {
        log.event(Level::INFO, "Only one remote file, downloading it in full")?;
        &entries
    } else {
        log.event(
            Level::INFO,
            &format!(
                "Newest remote file: {} (modified {})",
                newest.name,
                newest.modified_at.format("%Y-%m-%d %H:%M:%S")
            ),
        )?;
        std::slice::from_ref(newest)
    };

    for entry in targets {
        let outcome = until_shutdown(
            shutdown,
            transfer::fetch(store, entry, &options.local_dir, &options.transfer),
        )
        .await?;
        log.check()?;
        report.fetched.push((entry.name.clone(), outcome));
    }

    report.eviction = evict_if_fetched(store, &entries, &report, &options.remote_retention).await;
    log.check()?;
    Ok(report)
}

/// Remote eviction only runs when the newest entry is known to be
/// complete locally, so a failed download is never followed by deleting
/// other remote copies.
async fn evict_if_fetched(
    store: &dyn RemoteStore,
    entries: &[RemoteEntry],
    report: &RunReport,
    policy: &RetentionPolicy,
) -> Option<Eviction> {
    match report.fetched.last() {
        Some((_, outcome)) if outcome.is_complete() => {
            Some(retention::evict_oldest_remote(store, entries, policy).await)
        }
        Some((name, _)) => {
            tracing::warn!(
                "{} was not downloaded completely, skipping remote cleanup",
                name
            );
            None
        }
        None => None,
    }
}
