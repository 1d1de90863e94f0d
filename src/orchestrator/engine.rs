//! Task orchestrator: the public face of the engine.
//!
//! Owns the session registry, the checkpoint manager, and one background
//! worker per live session. Crash, restore, and delete take the session's
//! guard before touching its worker or its registry entry, which keeps
//! them linearizable with the worker's own publishes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, info_span, warn, Instrument};

use super::checkpoint_manager::CheckpointManager;
use super::registry::SessionRegistry;
use super::worker::{self, SessionGuard, Shared, WorkerRun};
use crate::collaborator::Collaborator;
use crate::models::checkpoint::CheckpointRecord;
use crate::models::session::{SessionState, SessionStatus, SessionSummary};
use crate::{AppError, Result};

/// Result of a [`TaskOrchestrator::restore`] call.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    /// Session the checkpoint belongs to.
    pub session_id: String,
    /// Checkpoint that was selected.
    pub checkpoint_id: String,
    /// Step index execution resumes at.
    pub resumed_step_number: usize,
    /// Planned step count.
    pub total_steps: usize,
    /// `false` when the session was already active and nothing changed.
    pub resumed: bool,
    /// Session state after the call.
    pub state: SessionState,
}

/// Aggregate counters for dashboards and the demo.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DemoStatus {
    /// Stored checkpoints across all sessions.
    pub checkpoints_available: u64,
    /// Newest checkpoint, if any.
    pub latest_checkpoint: Option<CheckpointRecord>,
    /// Registered sessions.
    pub sessions: usize,
    /// Sessions currently `running`.
    pub running: usize,
    /// Sessions currently `crashed`.
    pub crashed: usize,
    /// A restore would find something to resume.
    pub ready_for_demo: bool,
}

enum Dispatch {
    Done(CheckpointRecord),
    Queued(oneshot::Receiver<Result<CheckpointRecord>>),
}

/// Drives sessions through their lifecycle and exposes the engine API.
pub struct TaskOrchestrator {
    shared: Arc<Shared>,
    guards: std::sync::Mutex<HashMap<String, SessionGuard>>,
}

impl TaskOrchestrator {
    /// Assemble an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        checkpoints: CheckpointManager,
        collaborator: Arc<dyn Collaborator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                checkpoints,
                collaborator,
            }),
            guards: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The checkpoint manager backing this orchestrator.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.shared.checkpoints
    }

    /// Number of sessions holding a worker guard.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Guard for a session that `start` or `restore` is about to register.
    fn guard(&self, session_id: &str) -> SessionGuard {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            guards
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(WorkerRun::default()))),
        )
    }

    fn existing_guard(&self, session_id: &str) -> Option<SessionGuard> {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Guard for a registered session; unknown ids never get one.
    async fn registered_guard(&self, session_id: &str) -> Result<SessionGuard> {
        if let Some(guard) = self.existing_guard(session_id) {
            return Ok(guard);
        }
        // Registered without going through this orchestrator.
        self.get_status(session_id).await?;
        Ok(self.guard(session_id))
    }

    /// Drop the guard of a session that ended up unregistered, unless
    /// another caller is still holding it.
    async fn release_if_unregistered(&self, session_id: &str, guard: SessionGuard) {
        if !matches!(self.shared.registry.get(session_id).await, Ok(None)) {
            return;
        }
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        let unshared = guards
            .get(session_id)
            .is_some_and(|held| Arc::ptr_eq(held, &guard) && Arc::strong_count(&guard) == 2);
        if unshared {
            guards.remove(session_id);
        }
    }

    /// Register a new session and start its background worker.
    ///
    /// Returns immediately with the new `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `task` or `user_id` is blank.
    pub async fn start(&self, task: &str, user_id: &str) -> Result<String> {
        if task.trim().is_empty() {
            return Err(AppError::Validation("task must not be empty".into()));
        }
        if user_id.trim().is_empty() {
            return Err(AppError::Validation("user_id must not be empty".into()));
        }

        let state = SessionState::new(task.to_owned(), user_id.to_owned());
        let session_id = state.session_id.clone();
        let guard = self.guard(&session_id);
        let mut run = guard.lock().await;

        self.shared.registry.put(state.clone()).await?;
        worker::spawn(Arc::clone(&self.shared), Arc::clone(&guard), &mut run, state);

        info!(session_id, user_id, "session started");
        Ok(session_id)
    }

    /// Current state of one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is unknown.
    pub async fn get_status(&self, session_id: &str) -> Result<SessionState> {
        self.shared
            .registry
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// Summaries of every registered session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the registry's error.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let sessions = self.shared.registry.list().await?;
        Ok(sessions.iter().map(SessionState::summary).collect())
    }

    /// Take a checkpoint now, bypassing the interval gate.
    ///
    /// For a `running` session the worker takes it at its next step
    /// boundary and this call waits for it, up to
    /// `checkpoint.manual_timeout_seconds`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::InvalidState` if the session is `starting` or `crashed` or
    /// no step boundary is reached in time, or the snapshot/store error if
    /// the checkpoint fails.
    pub async fn create_checkpoint(&self, session_id: &str) -> Result<CheckpointRecord> {
        let span = info_span!("manual_checkpoint", session_id);
        let wait = self.shared.checkpoints.policy().manual_timeout();
        async {
            // A worker that finishes between dispatch and its next boundary
            // drops the request; the second pass sees the terminal status.
            for _ in 0..2 {
                match self.dispatch_checkpoint(session_id).await? {
                    Dispatch::Done(record) => return Ok(record),
                    Dispatch::Queued(reply) => match tokio::time::timeout(wait, reply).await {
                        Ok(Ok(result)) => return result,
                        Ok(Err(_)) => {}
                        Err(_) => {
                            warn!(wait_secs = wait.as_secs(), "no step boundary in time");
                            return Err(AppError::InvalidState(format!(
                                "session {session_id} did not reach a step boundary within {}s",
                                wait.as_secs()
                            )));
                        }
                    },
                }
            }
            Err(AppError::InvalidState(format!(
                "session {session_id} stopped before the checkpoint was taken"
            )))
        }
        .instrument(span)
        .await
    }

    async fn dispatch_checkpoint(&self, session_id: &str) -> Result<Dispatch> {
        let guard = self.registered_guard(session_id).await?;
        let run = guard.lock().await;
        let mut state = self.get_status(session_id).await?;

        match state.status {
            SessionStatus::Running => {
                let requests = run.requests.as_ref().ok_or_else(|| {
                    AppError::InvalidState(format!("session {session_id} has no active worker"))
                })?;
                let (reply, receiver) = oneshot::channel();
                requests.send(reply).map_err(|_| {
                    AppError::InvalidState(format!("session {session_id} worker has stopped"))
                })?;
                Ok(Dispatch::Queued(receiver))
            }
            SessionStatus::Completed | SessionStatus::Failed => {
                let record = self.shared.checkpoints.create_checkpoint(&mut state).await?;
                self.shared.registry.put(state).await?;
                Ok(Dispatch::Done(record))
            }
            SessionStatus::Starting | SessionStatus::Crashed => Err(AppError::InvalidState(
                format!(
                    "cannot checkpoint session {session_id} while {}",
                    state.status.as_str()
                ),
            )),
        }
    }

    /// Up to `limit` checkpoints across all sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store query fails.
    pub async fn list_checkpoints(&self, limit: u32) -> Result<Vec<CheckpointRecord>> {
        self.shared.checkpoints.list_checkpoints(limit).await
    }

    /// Fetch one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if it does not exist.
    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointRecord> {
        self.shared.checkpoints.get_checkpoint(checkpoint_id).await
    }

    /// Resume a session from a checkpoint (`None` selects the newest).
    ///
    /// A session that is registered and neither `crashed` nor `failed` is
    /// left alone; its current state is returned with `resumed == false`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no matching checkpoint exists,
    /// `AppError::InvalidState` if the checkpoint captured a failed step, or
    /// `AppError::Snapshot` if the record is corrupt or the backend cannot
    /// rehydrate it.
    pub async fn restore(&self, checkpoint_id: Option<&str>) -> Result<RestoreOutcome> {
        let record = self.shared.checkpoints.locate(checkpoint_id).await?;
        let span = info_span!(
            "restore",
            checkpoint_id = %record.checkpoint_id,
            session_id = %record.session_id
        );
        let owner = record.session_id.clone();
        let guard = self.guard(&owner);

        let outcome = async {
            let mut run = guard.lock().await;
            let checkpoint_id = record.checkpoint_id.clone();
            let session_id = record.session_id.clone();

            let restored = match self
                .shared
                .checkpoints
                .restore_from(record, self.shared.registry.as_ref())
                .await
            {
                Ok(restored) => restored,
                Err(AppError::RestoreConflict(reason)) => {
                    info!(reason, "session is active; restore is a no-op");
                    let state = self.get_status(&session_id).await?;
                    return Ok(RestoreOutcome {
                        session_id,
                        checkpoint_id,
                        resumed_step_number: state.current_step_index,
                        total_steps: state.total_steps,
                        resumed: false,
                        state,
                    });
                }
                Err(err) => return Err(err),
            };

            run.stop().await;
            worker::spawn(
                Arc::clone(&self.shared),
                Arc::clone(&guard),
                &mut run,
                restored.state.clone(),
            );

            Ok(RestoreOutcome {
                session_id,
                checkpoint_id,
                resumed_step_number: restored.checkpoint.step_number,
                total_steps: restored.checkpoint.total_steps,
                resumed: true,
                state: restored.state,
            })
        }
        .instrument(span)
        .await;

        if outcome.is_err() {
            self.release_if_unregistered(&owner, guard).await;
        }
        outcome
    }

    /// Stop a running session's worker immediately and mark it `crashed`.
    ///
    /// Checkpoints are kept; the session waits for [`restore`](Self::restore).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or
    /// `AppError::InvalidState` if it is not `running`.
    pub async fn simulate_crash(&self, session_id: &str) -> Result<SessionState> {
        let guard = self.registered_guard(session_id).await?;
        let mut run = guard.lock().await;

        let current = self.get_status(session_id).await?;
        if current.status != SessionStatus::Running {
            return Err(AppError::InvalidState(format!(
                "only running sessions can crash; {session_id} is {}",
                current.status.as_str()
            )));
        }

        run.cancel();
        self.shared
            .checkpoints
            .simulate_crash(session_id, self.shared.registry.as_ref())
            .await
    }

    /// Delete one checkpoint. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool> {
        self.shared.checkpoints.delete_checkpoint(checkpoint_id).await
    }

    /// Stop a session's worker, forget it, and delete its checkpoints.
    ///
    /// Returns `false` if the session was not registered.
    ///
    /// # Errors
    ///
    /// Returns the registry or store error.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let guard = self.existing_guard(session_id);
        let existed = {
            let mut run = match &guard {
                Some(guard) => Some(guard.lock().await),
                None => None,
            };
            if let Some(run) = run.as_mut() {
                run.stop().await;
            }
            let existed = self.shared.registry.delete(session_id).await?;
            let checkpoints = self
                .shared
                .checkpoints
                .delete_session_checkpoints(session_id)
                .await?;
            if existed || checkpoints > 0 {
                info!(session_id, checkpoints, "session deleted");
            }
            existed
        };

        if guard.is_some() {
            self.guards
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(session_id);
        }
        Ok(existed)
    }

    /// Counters for the demo dashboard.
    ///
    /// # Errors
    ///
    /// Returns the registry or store error.
    pub async fn demo_status(&self) -> Result<DemoStatus> {
        let sessions = self.shared.registry.list().await?;
        let checkpoints_available = self.shared.checkpoints.checkpoint_count().await?;
        let latest_checkpoint = self.shared.checkpoints.list_checkpoints(1).await?.pop();
        let count = |status: SessionStatus| sessions.iter().filter(|s| s.status == status).count();

        Ok(DemoStatus {
            checkpoints_available,
            ready_for_demo: latest_checkpoint.is_some(),
            latest_checkpoint,
            sessions: sessions.len(),
            running: count(SessionStatus::Running),
            crashed: count(SessionStatus::Crashed),
        })
    }

    /// Stop every worker. Session state stays in the registry.
    pub async fn shutdown(&self) {
        let guards: Vec<SessionGuard> = self
            .guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for guard in guards {
            guard.lock().await.stop().await;
        }
        info!("orchestrator stopped");
    }
}
