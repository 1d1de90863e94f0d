//! Retention service for time-based checkpoint purge.
//!
//! Runs as a background task deleting checkpoints older than
//! `retention_days`. The newest checkpoint of every session survives so a
//! crashed session always stays restorable.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::checkpoint_repo::CheckpointRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    repo: CheckpointRepo,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&repo, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass. Returns the number of checkpoints removed.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(repo: &CheckpointRepo, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let removed = repo.purge_older_than(cutoff).await?;
    info!(retention_days, removed, "retention purge completed");
    Ok(removed)
}
