//! Signal handling for a sync run.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the returned token. The run
//! then abandons its in-flight step, stops the tunnel and writes the end
//! marker. A second signal exits immediately with status 130.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        )
    };

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Cannot listen for Ctrl+C: {}", e);
                    return;
                }
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::warn!("Received shutdown signal, stopping the sync and closing the tunnel...");
                tracing::info!("Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                tracing::warn!("Force exit requested");
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_returns_live_token() {
        let token = install_signal_handler().unwrap();
        assert!(!token.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sighup_cancels_token() {
        let token = install_signal_handler().unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }
}
