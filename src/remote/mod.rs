//! Remote store access. The sync engine talks to the store only through the
//! [`RemoteStore`] trait; [`FtpSession`] is the production implementation.

pub mod error;
mod ftp;
#[cfg(test)]
pub(crate) mod memory;
mod reply;
#[cfg(test)]
pub(crate) mod test_server;

pub use error::RemoteError;
pub use ftp::FtpSession;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;

/// Minimal async view of a remote directory.
///
/// Implementations must serialize control-channel access internally:
/// [`RemoteStore::keep_alive`] may be called from a concurrent future while
/// [`RemoteStore::retrieve`] is streaming.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Raw entry names in the working directory, in server order.
    async fn list_names(&self) -> Result<Vec<String>, RemoteError>;

    /// Last modification time of `name`.
    async fn modified_at(&self, name: &str) -> Result<DateTime<Utc>, RemoteError>;

    /// Size of `name` in bytes.
    async fn size(&self, name: &str) -> Result<u64, RemoteError>;

    /// Stream `name` starting at byte `offset` into `sink`, returning the
    /// number of bytes written. Bytes are written as they arrive.
    async fn retrieve(
        &self,
        name: &str,
        offset: u64,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError>;

    async fn delete(&self, name: &str) -> Result<(), RemoteError>;

    /// Idle no-op on the control channel.
    async fn keep_alive(&self) -> Result<(), RemoteError>;

    /// Close the session politely.
    async fn quit(&self) -> Result<(), RemoteError>;
}
