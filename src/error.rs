//! Failure taxonomy shared by the sync engine.

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The rest of the run cannot proceed; acquired resources are still released.
    FatalToRun,
    /// Only one remote entry or one deletion is affected; the run continues.
    PerEntry,
    /// Left for the next scheduled run to recover (e.g. a partial download).
    RetryNextRun,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::FatalToRun => "fatal",
            ErrorKind::PerEntry => "per-entry",
            ErrorKind::RetryNextRun => "retry-next-run",
        })
    }
}
