//! Standalone local capacity enforcement, meant to be scheduled separately
//! from the sync run.

use crate::config::MirrorConfig;
use crate::retention::{self, Eviction};
use crate::session_log::SessionLog;

pub async fn run(config: &MirrorConfig, log: &SessionLog) -> anyhow::Result<Eviction> {
    tracing::info!("Starting folder cleanup in {}", config.local_dir.display());
    let eviction = retention::enforce_local_capacity(&config.local_dir, &config.retention).await;
    match &eviction {
        Ok(Eviction::Failed { target, reason }) => {
            tracing::error!("Folder cleanup could not remove {}: {}", target, reason)
        }
        Ok(_) => tracing::info!("Folder cleanup finished"),
        Err(e) => tracing::error!("Folder cleanup failed: {}", e),
    }
    log.check()?;
    eviction
}
