use thiserror::Error;

/// Errors raised while talking to the remote store.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("{command} rejected by server: {code} {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    #[error("Malformed server reply: {0}")]
    Protocol(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Connection error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Local write failed: {0}")]
    LocalWrite(std::io::Error),
}

impl RemoteError {
    /// The server answered with a permanent negative reply (5xx).
    pub fn is_permanent_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected { code, .. } if (500..600).contains(code))
    }
}
