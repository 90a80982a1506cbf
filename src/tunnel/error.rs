use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Errors from bringing the tunnel up or down.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to start tunnel process {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("TunnelTimeout: no {prefix}* interface after {}s", waited.as_secs())]
    Timeout { prefix: String, waited: Duration },

    #[error("Tunnel process exited before its interface came up ({0})")]
    Exited(ExitStatus),

    #[error("Shutdown requested while waiting for the tunnel")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
