//! Resumable download of a single remote entry into the mirror directory.
//!
//! The local file is the only transfer state: its length decides whether
//! the entry is skipped, resumed, downloaded again, or fetched from scratch.
//! A failed transfer leaves the partial file in place for the next run.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::catalog::RemoteEntry;
use crate::config::is_plain_file_name;
use crate::error::ErrorKind;
use crate::remote::{RemoteError, RemoteStore};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Refusing unsafe remote file name {0:?}")]
    UnsafeName(String),

    #[error("Could not fetch remote size of {name}: {source}")]
    RemoteSize { name: String, source: RemoteError },

    #[error("Transfer of {name} interrupted: {source}")]
    Interrupted { name: String, source: RemoteError },

    #[error("Local I/O error on {}: {source}", path.display())]
    Local {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Size mismatch for {name}: local {local} bytes, remote {remote} bytes")]
    SizeMismatch { name: String, local: u64, remote: u64 },
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Interrupted { .. } | TransferError::SizeMismatch { .. } => {
                ErrorKind::RetryNextRun
            }
            TransferError::RemoteSize { source, .. } if !source.is_permanent_rejection() => {
                ErrorKind::RetryNextRun
            }
            TransferError::UnsafeName(_)
            | TransferError::RemoteSize { .. }
            | TransferError::Local { .. } => ErrorKind::PerEntry,
        }
    }
}

/// What to do with a remote entry given the local and remote lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Skip,
    Resume(u64),
    Overwrite,
    Fresh,
}

pub fn plan(local_len: u64, remote_len: u64) -> Plan {
    if local_len == remote_len {
        Plan::Skip
    } else if local_len == 0 {
        Plan::Fresh
    } else if local_len < remote_len {
        Plan::Resume(local_len)
    } else {
        Plan::Overwrite
    }
}

#[derive(Debug)]
pub enum Outcome {
    Completed { bytes: u64, elapsed: Duration },
    Skipped,
    Failed(TransferError),
}

impl Outcome {
    /// Whether the local copy is known to match the remote entry.
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Completed { .. } | Outcome::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub keepalive_interval: Duration,
    pub no_progress_bar: bool,
}

/// Fetch `entry` into `local_dir`, resuming or skipping as the local file
/// allows. Never returns an error: failures are reported as
/// [`Outcome::Failed`] and logged.
pub async fn fetch(
    store: &dyn RemoteStore,
    entry: &RemoteEntry,
    local_dir: &Path,
    options: &TransferOptions,
) -> Outcome {
    match try_fetch(store, entry, local_dir, options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Download of {} failed: {}", entry.name, e);
            Outcome::Failed(e)
        }
    }
}

async fn try_fetch(
    store: &dyn RemoteStore,
    entry: &RemoteEntry,
    local_dir: &Path,
    options: &TransferOptions,
) -> Result<Outcome, TransferError> {
    if !is_plain_file_name(&entry.name) {
        return Err(TransferError::UnsafeName(entry.name.clone()));
    }
    let path = local_dir.join(&entry.name);
    let local_error = |source| TransferError::Local {
        path: path.clone(),
        source,
    };

    let remote_len = entry
        .size(store)
        .await
        .map_err(|source| TransferError::RemoteSize {
            name: entry.name.clone(),
            source,
        })?;
    let local_len = local_len(&path).await.map_err(local_error)?;

    let (file, offset) = match plan(local_len, remote_len) {
        Plan::Skip => {
            tracing::info!("{} is already complete ({} bytes), skipping", entry.name, remote_len);
            return Ok(Outcome::Skipped);
        }
        Plan::Resume(offset) => {
            tracing::info!(
                "Resuming {} from byte {} of {}",
                entry.name,
                offset,
                remote_len
            );
            let file = OpenOptions::new().append(true).open(&path).await;
            (file, offset)
        }
        Plan::Overwrite => {
            tracing::warn!(
                "Local {} is larger than remote ({} > {} bytes), downloading it again",
                entry.name,
                local_len,
                remote_len
            );
            (File::create(&path).await, 0)
        }
        Plan::Fresh => {
            tracing::info!("Downloading {} ({} bytes)", entry.name, remote_len);
            (File::create(&path).await, 0)
        }
    };
    let file = file.map_err(local_error)?;

    let pb = create_progress_bar(options.no_progress_bar, &entry.name, remote_len, offset);
    let mut sink = ProgressWriter {
        inner: file,
        pb: pb.clone(),
    };
    let started = Instant::now();

    let stop = CancellationToken::new();
    let transfer = async {
        let result = store.retrieve(&entry.name, offset, &mut sink).await;
        stop.cancel();
        result
    };
    let (result, keepalives) = tokio::join!(
        transfer,
        heartbeat(store, options.keepalive_interval, &stop)
    );
    if keepalives > 0 {
        tracing::debug!("Sent {} keep-alive(s) during {}", keepalives, entry.name);
    }

    // Whatever arrived stays on disk for the next run.
    let flushed = sink.inner.flush().await;
    pb.finish_and_clear();

    let written = result.map_err(|e| match e {
        RemoteError::LocalWrite(source) => local_error(source),
        source => TransferError::Interrupted {
            name: entry.name.clone(),
            source,
        },
    })?;
    flushed.map_err(local_error)?;

    let final_len = local_len_of(&path).await.map_err(local_error)?;
    if final_len != remote_len {
        return Err(TransferError::SizeMismatch {
            name: entry.name.clone(),
            local: final_len,
            remote: remote_len,
        });
    }

    let elapsed = started.elapsed();
    tracing::info!(
        "Downloaded {} ({} bytes) in {}",
        entry.name,
        written,
        format_duration(elapsed)
    );
    Ok(Outcome::Completed {
        bytes: written,
        elapsed,
    })
}

/// Length of the local file, 0 when it does not exist yet.
async fn local_len(path: &Path) -> std::io::Result<u64> {
    match local_len_of(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        other => other,
    }
}

async fn local_len_of(path: &Path) -> std::io::Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}

/// Send a keep-alive every `every` until `stop` fires. The first one goes
/// out one full interval after the start. Returns how many were sent.
async fn heartbeat(store: &dyn RemoteStore, every: Duration, stop: &CancellationToken) -> u32 {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval's first tick completes immediately
    ticker.tick().await;

    let mut sent = 0;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.keep_alive().await {
                    tracing::warn!("Keep-alive failed, stopping heartbeat: {}", e);
                    break;
                }
                sent += 1;
            }
        }
    }
    sent
}

/// Passes writes through and advances the progress bar.
struct ProgressWriter {
    inner: File,
    pb: ProgressBar,
}

impl AsyncWrite for ProgressWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.pb.inc(*n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Hidden when `--no-progress-bar` is set or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, name: &str, total: u64, position: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta})",
    )
    .map(|s| s.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(name.to_string());
    pb.set_position(position);
    pb
}

pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
