//! Checkpoint creation, restore, crash simulation, and deletion.
//!
//! Checkpoints are only ever taken between steps. Creation is split into
//! a backend snapshot ([`CheckpointManager::prepare_checkpoint`]) and a
//! store write ([`CheckpointManager::save_checkpoint`]) so a session worker
//! can abandon the slow half when it is cancelled. Automatic checkpoints
//! are best-effort: a failing snapshot backend is counted through
//! [`CheckpointManager::record_failure`] and the session keeps running
//! un-checkpointed. Restore failures, by contrast, always propagate to the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use super::registry::SessionRegistry;
use crate::config::{CheckpointConfig, SnapshotConfig};
use crate::models::checkpoint::CheckpointRecord;
use crate::models::session::{SessionState, SessionStatus};
use crate::persistence::checkpoint_repo::CheckpointRepo;
use crate::snapshot::SnapshotBackend;
use crate::{AppError, Result};

/// A checkpoint rehydrated into a runnable session.
#[derive(Debug, Clone)]
pub struct RestoredSession {
    /// The checkpoint that was restored.
    pub checkpoint: CheckpointRecord,
    /// Reconstructed state, status `running`, index at `step_number`.
    pub state: SessionState,
}

/// A backend snapshot that has not been written to the store yet.
#[derive(Debug)]
pub struct PendingCheckpoint {
    record: CheckpointRecord,
    checkpoint_count: u32,
    last_checkpoint_at: Option<DateTime<Utc>>,
}

impl PendingCheckpoint {
    /// The record that saving will store.
    #[must_use]
    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }
}

/// Decides when to checkpoint and performs snapshot bookkeeping.
#[derive(Clone)]
pub struct CheckpointManager {
    repo: CheckpointRepo,
    backend: Arc<dyn SnapshotBackend>,
    snapshot: SnapshotConfig,
    policy: CheckpointConfig,
}

/// Whether an automatic checkpoint is due at `now`.
///
/// Always due for a session that has never been checkpointed.
#[must_use]
pub fn is_due(state: &SessionState, min_interval: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = state.last_checkpoint_at else {
        return true;
    };
    let elapsed = now.signed_duration_since(last);
    // A clock step backwards counts as "not yet due".
    elapsed
        .to_std()
        .is_ok_and(|elapsed| elapsed >= min_interval)
}

impl CheckpointManager {
    /// Construct a manager over the given store and backend.
    #[must_use]
    pub fn new(
        repo: CheckpointRepo,
        backend: Arc<dyn SnapshotBackend>,
        snapshot: SnapshotConfig,
        policy: CheckpointConfig,
    ) -> Self {
        Self {
            repo,
            backend,
            snapshot,
            policy,
        }
    }

    /// The checkpoint policy in effect.
    #[must_use]
    pub fn policy(&self) -> &CheckpointConfig {
        &self.policy
    }

    /// Checkpoint `state` if `min_interval` has elapsed since the last one,
    /// or unconditionally when `boundary` is set (plan completion).
    ///
    /// Failures are logged and counted on the session, never returned.
    pub async fn maybe_checkpoint(
        &self,
        state: &mut SessionState,
        min_interval: Duration,
        boundary: bool,
    ) -> Option<CheckpointRecord> {
        if !boundary && !is_due(state, min_interval, Utc::now()) {
            return None;
        }

        match self.create_checkpoint(state).await {
            Ok(record) => Some(record),
            Err(err) => {
                self.record_failure(state, &err);
                None
            }
        }
    }

    /// Count a failed automatic checkpoint on `state` and log it, escalating
    /// to `error` once the configured threshold is reached.
    pub fn record_failure(&self, state: &mut SessionState, err: &AppError) {
        state.consecutive_checkpoint_failures += 1;
        let failures = state.consecutive_checkpoint_failures;
        if failures >= self.policy.failure_escalation_threshold {
            error!(
                session_id = %state.session_id,
                failures,
                %err,
                "checkpointing keeps failing; session is running unprotected"
            );
        } else {
            warn!(
                session_id = %state.session_id,
                failures,
                %err,
                "checkpoint failed; continuing without it"
            );
        }
    }

    /// Snapshot `state` now, bypassing the interval gate.
    ///
    /// On success the session's checkpoint bookkeeping is updated; the
    /// captured state already carries the updated values.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if a step is in progress,
    /// `AppError::Snapshot` if the backend fails, or `AppError::Db` if the
    /// record cannot be stored.
    pub async fn create_checkpoint(&self, state: &mut SessionState) -> Result<CheckpointRecord> {
        let pending = self.prepare_checkpoint(state).await?;
        self.save_checkpoint(state, pending).await
    }

    /// Snapshot `state` through the backend without storing anything.
    ///
    /// Dropping the returned future, or the [`PendingCheckpoint`], leaves
    /// the store and `state` untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if a step is in progress or
    /// `AppError::Snapshot` if the backend fails.
    #[instrument(
        skip_all,
        fields(session_id = %state.session_id, step_number = state.current_step_index)
    )]
    pub async fn prepare_checkpoint(&self, state: &SessionState) -> Result<PendingCheckpoint> {
        if state.has_step_in_progress() {
            return Err(AppError::InvalidState(
                "cannot checkpoint while a step is in progress".into(),
            ));
        }

        let container_id = self.snapshot.container_id(&state.session_id);
        let snapshot_ref = self.backend.create(&container_id).await?;

        let mut captured = state.clone();
        captured.checkpoint_count += 1;
        captured.last_checkpoint_at = Some(Utc::now());
        captured.consecutive_checkpoint_failures = 0;

        let record = CheckpointRecord::capture(&captured, snapshot_ref)?;
        Ok(PendingCheckpoint {
            record,
            checkpoint_count: captured.checkpoint_count,
            last_checkpoint_at: captured.last_checkpoint_at,
        })
    }

    /// Store a prepared checkpoint and apply its bookkeeping to `state`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if `pending` was prepared for another
    /// session, or `AppError::Db` if the record cannot be stored.
    pub async fn save_checkpoint(
        &self,
        state: &mut SessionState,
        pending: PendingCheckpoint,
    ) -> Result<CheckpointRecord> {
        if pending.record.session_id != state.session_id {
            return Err(AppError::InvalidState(format!(
                "checkpoint prepared for session {} cannot be saved to {}",
                pending.record.session_id, state.session_id
            )));
        }
        let saved = self.repo.create(&pending.record).await?;

        state.checkpoint_count = pending.checkpoint_count;
        state.last_checkpoint_at = pending.last_checkpoint_at;
        state.consecutive_checkpoint_failures = 0;

        info!(
            session_id = %saved.session_id,
            checkpoint_id = %saved.checkpoint_id,
            step_number = saved.step_number,
            total_steps = saved.total_steps,
            snapshot_ref = %saved.snapshot_ref,
            "checkpoint created"
        );
        Ok(saved)
    }

    /// Find the checkpoint to restore: the named one, or the newest overall.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the id is unknown or no checkpoint
    /// exists.
    pub async fn locate(&self, checkpoint_id: Option<&str>) -> Result<CheckpointRecord> {
        match checkpoint_id {
            Some(id) => self.repo.get_by_id(id).await,
            None => self
                .repo
                .latest()
                .await?
                .ok_or_else(|| AppError::NotFound("no checkpoints available".into())),
        }
    }

    /// Locate and restore a checkpoint in one call.
    ///
    /// # Errors
    ///
    /// See [`locate`](Self::locate) and [`restore_from`](Self::restore_from).
    pub async fn restore(
        &self,
        checkpoint_id: Option<&str>,
        registry: &dyn SessionRegistry,
    ) -> Result<RestoredSession> {
        let record = self.locate(checkpoint_id).await?;
        self.restore_from(record, registry).await
    }

    /// Rebuild the session captured by `record` and register it as `running`.
    ///
    /// Checkpoints of the same session created after `record` are removed
    /// so the session's checkpoint timeline stays monotonic.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RestoreConflict` if the session is registered and
    /// neither `crashed` nor `failed`, `AppError::InvalidState` if the record
    /// captured a failed step, or `AppError::Snapshot` if the record is
    /// corrupt or the backend cannot rehydrate it.
    #[instrument(skip_all, fields(checkpoint_id = %record.checkpoint_id, session_id = %record.session_id))]
    pub async fn restore_from(
        &self,
        record: CheckpointRecord,
        registry: &dyn SessionRegistry,
    ) -> Result<RestoredSession> {
        if let Some(current) = registry.get(&record.session_id).await? {
            if !current.status.is_restorable() {
                return Err(AppError::RestoreConflict(format!(
                    "session {} is {}",
                    current.session_id,
                    current.status.as_str()
                )));
            }
        }

        let mut state = record.rehydrate()?;
        self.backend.restore(&record.snapshot_ref).await?;

        let discarded = self.repo.delete_newer_than(&record).await?;
        if discarded > 0 {
            info!(discarded, "dropped checkpoints newer than the restore point");
        }

        state.status = SessionStatus::Running;
        state.final_response = None;
        state.error = None;
        state.touch();
        registry.put(state.clone()).await?;

        info!(
            step_number = record.step_number,
            total_steps = record.total_steps,
            "session restored from checkpoint"
        );
        Ok(RestoredSession {
            checkpoint: record,
            state,
        })
    }

    /// Discard the live process for a running session and mark it `crashed`.
    ///
    /// Checkpoint records are left untouched. A backend discard failure is
    /// logged; the session is still marked crashed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or
    /// `AppError::InvalidState` if it is not `running`.
    #[instrument(skip(self, registry))]
    pub async fn simulate_crash(
        &self,
        session_id: &str,
        registry: &dyn SessionRegistry,
    ) -> Result<SessionState> {
        let mut state = registry
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

        if state.status != SessionStatus::Running {
            return Err(AppError::InvalidState(format!(
                "only running sessions can crash; {session_id} is {}",
                state.status.as_str()
            )));
        }

        let container_id = self.snapshot.container_id(session_id);
        if let Err(err) = self.backend.discard(&container_id).await {
            warn!(%err, container_id, "discard failed; marking session crashed anyway");
        }

        state.transition_to(SessionStatus::Crashed)?;
        registry.put(state.clone()).await?;

        warn!(
            step_index = state.current_step_index,
            "session crashed; restore to recover"
        );
        Ok(state)
    }

    /// Fetch one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the checkpoint does not exist.
    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointRecord> {
        self.repo.get_by_id(checkpoint_id).await
    }

    /// List up to `limit` checkpoints, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_checkpoints(&self, limit: u32) -> Result<Vec<CheckpointRecord>> {
        self.repo.list(limit).await
    }

    /// All checkpoints of one session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn session_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRecord>> {
        self.repo.list_for_session(session_id).await
    }

    /// Number of stored checkpoints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn checkpoint_count(&self) -> Result<u64> {
        self.repo.count().await
    }

    /// Delete one checkpoint. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool> {
        let deleted = self.repo.delete(checkpoint_id).await?;
        if deleted {
            info!(checkpoint_id, "checkpoint deleted");
        }
        Ok(deleted)
    }

    /// Delete every checkpoint of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_session_checkpoints(&self, session_id: &str) -> Result<u64> {
        self.repo.delete_for_session(session_id).await
    }
}
