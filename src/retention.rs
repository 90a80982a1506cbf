//! Oldest-first eviction for the remote directory and the local mirror.
//!
//! Each call deletes at most one entry. Repeated runs converge a store back
//! under its limit.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::catalog::RemoteEntry;
use crate::remote::RemoteStore;

const GIB: f64 = (1u64 << 30) as f64;
const TIB: f64 = (1u64 << 40) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionScope {
    /// Limit counts entries in the remote directory.
    Remote,
    /// Limit counts bytes under the local mirror.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Bytes for [`RetentionScope::Local`], entries for
    /// [`RetentionScope::Remote`].
    pub capacity_limit: u64,
    pub scope: RetentionScope,
}

impl RetentionPolicy {
    /// The remote side keeps only the newest entry.
    pub fn remote() -> Self {
        Self {
            capacity_limit: 1,
            scope: RetentionScope::Remote,
        }
    }
}

/// Result of one eviction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// Within the limit; nothing was touched.
    Retained,
    Deleted { target: String, size: Option<u64> },
    /// The chosen target disappeared before it could be removed.
    AlreadyGone { target: String },
    Failed { target: String, reason: String },
}

/// Delete the oldest remote entry when more entries exist than the policy
/// allows. `entries` must be sorted oldest first. The last entry is never
/// deleted.
pub async fn evict_oldest_remote(
    store: &dyn RemoteStore,
    entries: &[RemoteEntry],
    policy: &RetentionPolicy,
) -> Eviction {
    let keep = policy.capacity_limit.max(1) as usize;
    if entries.len() <= keep {
        tracing::debug!(
            "Remote holds {} entr{}, nothing to evict",
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" }
        );
        return Eviction::Retained;
    }

    let oldest = &entries[0];
    tracing::info!(
        "Deleting oldest remote file {} (modified {})",
        oldest.name,
        oldest.modified_at.format("%Y-%m-%d %H:%M:%S")
    );
    match store.delete(&oldest.name).await {
        Ok(()) => {
            tracing::info!("Deleted remote file {}", oldest.name);
            Eviction::Deleted {
                target: oldest.name.clone(),
                size: None,
            }
        }
        Err(e) => {
            tracing::warn!("Could not delete remote file {}: {}", oldest.name, e);
            Eviction::Failed {
                target: oldest.name.clone(),
                reason: e.to_string(),
            }
        }
    }
}

/// A regular file under the local mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: SystemTime,
}

/// Every regular file under `dir`, recursively. Symlinks are not followed.
/// Entries that vanish mid-walk are skipped.
pub fn scan_local(dir: &Path) -> std::io::Result<Vec<LocalEntry>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    let mut root = true;

    while let Some(current) = pending.pop() {
        let read = match std::fs::read_dir(&current) {
            Ok(read) => read,
            Err(e) if root => return Err(e),
            Err(e) => {
                tracing::warn!("Skipping unreadable directory {}: {}", current.display(), e);
                continue;
            }
        };
        root = false;

        for entry in read.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                files.push(LocalEntry {
                    path: entry.path(),
                    size: meta.len(),
                    modified_at: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }
    Ok(files)
}

/// Oldest by mtime; ties go to the lexicographically smaller path.
pub fn oldest_local(files: &[LocalEntry]) -> Option<&LocalEntry> {
    files
        .iter()
        .min_by(|a, b| (a.modified_at, &a.path).cmp(&(b.modified_at, &b.path)))
}

pub fn total_size(files: &[LocalEntry]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

pub(crate) fn format_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / GIB)
}

pub(crate) fn format_tb(bytes: u64) -> String {
    format!("{:.2} TB", bytes as f64 / TIB)
}

/// Blocking body of [`enforce_local_capacity`].
pub fn enforce_local_capacity_blocking(
    dir: &Path,
    policy: &RetentionPolicy,
) -> std::io::Result<Eviction> {
    let files = scan_local(dir)?;
    let total = total_size(&files);
    tracing::info!(
        "Mirror usage: {} of {} ({} files)",
        format_tb(total),
        format_tb(policy.capacity_limit),
        files.len()
    );
    if total <= policy.capacity_limit {
        tracing::info!("Mirror is within its capacity limit, nothing to delete");
        return Ok(Eviction::Retained);
    }

    if files.len() <= 1 {
        tracing::warn!("Mirror over capacity but holds a single file, keeping it");
        return Ok(Eviction::Retained);
    }
    let Some(oldest) = oldest_local(&files) else {
        return Ok(Eviction::Retained);
    };
    tracing::info!("Mirror over capacity, deleting oldest file {}", oldest.path.display());
    Ok(remove_local(oldest))
}

/// Remove one mirror file. A file that is already gone is not an error.
fn remove_local(entry: &LocalEntry) -> Eviction {
    let target = entry.path.display().to_string();
    match std::fs::remove_file(&entry.path) {
        Ok(()) => {
            tracing::info!("Deleted {} ({})", target, format_gb(entry.size));
            Eviction::Deleted {
                target,
                size: Some(entry.size),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("{} was already removed", target);
            Eviction::AlreadyGone { target }
        }
        Err(e) => {
            tracing::warn!("Could not delete {}: {}", target, e);
            Eviction::Failed {
                target,
                reason: e.to_string(),
            }
        }
    }
}

/// Delete the single oldest file under `dir` when the mirror's aggregate
/// size exceeds the policy limit.
pub async fn enforce_local_capacity(
    dir: &Path,
    policy: &RetentionPolicy,
) -> anyhow::Result<Eviction> {
    let dir = dir.to_path_buf();
    let policy = policy.clone();
    let eviction =
        tokio::task::spawn_blocking(move || enforce_local_capacity_blocking(&dir, &policy))
            .await??;
    Ok(eviction)
}
