//! Remote directory enumeration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use crate::config::FtpConfig;
use crate::remote::{FtpSession, RemoteError, RemoteStore};

/// One file in the remote directory. The size is fetched on first use.
#[derive(Debug)]
pub struct RemoteEntry {
    pub name: String,
    pub modified_at: DateTime<Utc>,
    size: OnceCell<u64>,
}

impl RemoteEntry {
    pub fn new(name: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified_at,
            size: OnceCell::new(),
        }
    }

    /// Remote size in bytes, asked from the store at most once.
    pub async fn size(&self, store: &dyn RemoteStore) -> Result<u64, RemoteError> {
        self.size
            .get_or_try_init(|| store.size(&self.name))
            .await
            .copied()
    }
}

/// Open an authenticated session in the configured remote directory.
pub async fn connect(config: &FtpConfig) -> Result<FtpSession, RemoteError> {
    FtpSession::connect(config).await
}

/// Opens remote sessions for a run.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: &FtpConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Connector for FtpConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        Ok(Arc::new(connect(&self.config).await?))
    }
}

/// Directory-like names carry no extension.
fn looks_like_file(name: &str) -> bool {
    name != "." && name != ".." && name.contains('.')
}

/// List remote files ordered by modification time, oldest first.
///
/// Entries whose timestamp cannot be fetched are dropped with a warning.
/// Ties keep the server's enumeration order.
pub async fn list(store: &dyn RemoteStore) -> Result<Vec<RemoteEntry>, RemoteError> {
    tracing::info!("Fetching remote file list...");
    let names = store.list_names().await?;

    let mut entries = Vec::with_capacity(names.len());
    for name in names.into_iter().filter(|n| looks_like_file(n)) {
        match store.modified_at(&name).await {
            Ok(modified_at) => entries.push(RemoteEntry::new(name, modified_at)),
            Err(e) => tracing::warn!("Could not fetch modification time for {}: {}", name, e),
        }
    }

    // sort_by_key is stable
    entries.sort_by_key(|e| e.modified_at);
    tracing::info!("Found {} remote files", entries.len());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{ts, MemoryStore};

    fn names(entries: &[RemoteEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_list_sorts_ascending_by_mtime() {
        let store = MemoryStore::new()
            .with_file("c.bin", ts(300), vec![])
            .with_file("a.bin", ts(100), vec![])
            .with_file("b.bin", ts(200), vec![]);
        let entries = list(&store).await.unwrap();
        assert_eq!(names(&entries), ["a.bin", "b.bin", "c.bin"]);
        assert!(entries.windows(2).all(|w| w[0].modified_at < w[1].modified_at));
    }

    #[tokio::test]
    async fn test_list_ties_keep_enumeration_order() {
        let store = MemoryStore::new()
            .with_file("z.bin", ts(100), vec![])
            .with_file("late.bin", ts(500), vec![])
            .with_file("m.bin", ts(100), vec![])
            .with_file("a.bin", ts(100), vec![]);
        let entries = list(&store).await.unwrap();
        assert_eq!(names(&entries), ["z.bin", "m.bin", "a.bin", "late.bin"]);
    }

    #[tokio::test]
    async fn test_list_drops_entries_without_mtime() {
        let store = MemoryStore::new()
            .with_file("a.bin", ts(100), vec![])
            .with_file("broken.bin", ts(50), vec![])
            .with_file("b.bin", ts(200), vec![])
            .with_unreadable_mtime("broken.bin");
        let entries = list(&store).await.unwrap();
        assert_eq!(names(&entries), ["a.bin", "b.bin"]);
    }

    #[tokio::test]
    async fn test_list_filters_directory_like_names() {
        let store = MemoryStore::new()
            .with_file("archive", ts(10), vec![])
            .with_file(".", ts(10), vec![])
            .with_file("..", ts(10), vec![])
            .with_file("dump.sql.gz", ts(20), vec![]);
        let entries = list(&store).await.unwrap();
        assert_eq!(names(&entries), ["dump.sql.gz"]);
    }

    #[tokio::test]
    async fn test_list_empty_directory_is_not_an_error() {
        let store = MemoryStore::new();
        assert!(list(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_mtimes_failing_yields_empty() {
        let store = MemoryStore::new()
            .with_file("a.bin", ts(1), vec![])
            .with_unreadable_mtime("a.bin");
        assert!(list(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_size_is_lazy_and_cached() {
        let store = MemoryStore::new().with_file("a.bin", ts(1), vec![0u8; 12]);
        let entry = RemoteEntry::new("a.bin", ts(1));
        assert_eq!(entry.size(&store).await.unwrap(), 12);
        let other = MemoryStore::new();
        // Cached: the second store is never asked.
        assert_eq!(entry.size(&other).await.unwrap(), 12);
    }
}
