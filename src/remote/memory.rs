//! In-memory [`RemoteStore`] used by the engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{RemoteError, RemoteStore};

struct MemoryFile {
    name: String,
    modified_at: DateTime<Utc>,
    data: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    files: Mutex<Vec<MemoryFile>>,
    unreadable_mtime: HashSet<String>,
    fail_retrieve_after: Option<u64>,
    local_full_after: Option<u64>,
    fail_deletes: bool,
    retrieve_delay: Option<Duration>,
    noops: AtomicU32,
    retrieves: Mutex<Vec<(String, u64)>>,
    quits: AtomicU32,
}

/// Seconds since the epoch as a UTC timestamp, for terse fixtures.
pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, name: &str, modified_at: DateTime<Utc>, data: Vec<u8>) -> Self {
        self.files.lock().unwrap().push(MemoryFile {
            name: name.to_string(),
            modified_at,
            data,
        });
        self
    }

    /// MDTM for `name` fails.
    pub fn with_unreadable_mtime(mut self, name: &str) -> Self {
        self.unreadable_mtime.insert(name.to_string());
        self
    }

    /// Every retrieve breaks with a network error after `bytes` bytes.
    pub fn failing_after(mut self, bytes: u64) -> Self {
        self.fail_retrieve_after = Some(bytes);
        self
    }

    /// Writes into the local sink fail with `StorageFull` once `bytes`
    /// bytes have been written, as on a full disk.
    pub fn local_full_after(mut self, bytes: u64) -> Self {
        self.local_full_after = Some(bytes);
        self
    }

    pub fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    /// Each retrieve waits this long before sending data.
    pub fn with_retrieve_delay(mut self, delay: Duration) -> Self {
        self.retrieve_delay = Some(delay);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn noop_count(&self) -> u32 {
        self.noops.load(Ordering::SeqCst)
    }

    pub fn quit_count(&self) -> u32 {
        self.quits.load(Ordering::SeqCst)
    }

    /// `(name, offset)` of every retrieve call.
    pub fn retrieves(&self) -> Vec<(String, u64)> {
        self.retrieves.lock().unwrap().clone()
    }

    fn data(&self, name: &str) -> Result<Vec<u8>, RemoteError> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.data.clone())
            .ok_or_else(|| not_found(name))
    }
}

fn not_found(name: &str) -> RemoteError {
    RemoteError::Rejected {
        command: name.to_string(),
        code: 550,
        message: "No such file".to_string(),
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryStore {
    async fn list_names(&self) -> Result<Vec<String>, RemoteError> {
        Ok(self.names())
    }

    async fn modified_at(&self, name: &str) -> Result<DateTime<Utc>, RemoteError> {
        if self.unreadable_mtime.contains(name) {
            return Err(RemoteError::Rejected {
                command: format!("MDTM {}", name),
                code: 550,
                message: "Could not get file modification time".to_string(),
            });
        }
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.modified_at)
            .ok_or_else(|| not_found(name))
    }

    async fn size(&self, name: &str) -> Result<u64, RemoteError> {
        self.data(name).map(|d| d.len() as u64)
    }

    async fn retrieve(
        &self,
        name: &str,
        offset: u64,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        self.retrieves
            .lock()
            .unwrap()
            .push((name.to_string(), offset));
        let data = self.data(name)?;
        if let Some(delay) = self.retrieve_delay {
            tokio::time::sleep(delay).await;
        }

        let start = (offset as usize).min(data.len());
        let mut written = 0u64;
        for chunk in data[start..].chunks(4) {
            if self.fail_retrieve_after.is_some_and(|limit| written >= limit) {
                return Err(RemoteError::Network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            if self.local_full_after.is_some_and(|limit| written >= limit) {
                return Err(RemoteError::LocalWrite(std::io::Error::new(
                    std::io::ErrorKind::StorageFull,
                    "no space left on device",
                )));
            }
            sink.write_all(chunk)
                .await
                .map_err(RemoteError::LocalWrite)?;
            written += chunk.len() as u64;
        }
        sink.flush().await.map_err(RemoteError::LocalWrite)?;
        Ok(written)
    }

    async fn delete(&self, name: &str) -> Result<(), RemoteError> {
        if self.fail_deletes {
            return Err(RemoteError::Rejected {
                command: format!("DELE {}", name),
                code: 550,
                message: "Permission denied".to_string(),
            });
        }
        let mut files = self.files.lock().unwrap();
        let before = files.len();
        files.retain(|f| f.name != name);
        if files.len() == before {
            return Err(not_found(name));
        }
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), RemoteError> {
        self.noops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn quit(&self) -> Result<(), RemoteError> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
