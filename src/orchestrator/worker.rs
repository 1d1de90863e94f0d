//! Per-session background worker.
//!
//! One worker drives one session from `starting` through planning and the
//! step loop to a terminal status. It owns its working copy of the state
//! and publishes full replacements to the registry. Every publish happens
//! under the session guard and is skipped once the worker's cancellation
//! token fires, so a crashed or restored session never sees a write from
//! a stale worker.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::checkpoint_manager::{is_due, CheckpointManager};
use super::registry::SessionRegistry;
use super::step_runner::{self, StepOutcome};
use crate::collaborator::Collaborator;
use crate::models::checkpoint::CheckpointRecord;
use crate::models::session::{SessionState, SessionStatus};
use crate::{AppError, Result};

/// Reply channel for a manual checkpoint request.
pub(crate) type CheckpointReply = oneshot::Sender<Result<CheckpointRecord>>;

/// Services shared by the orchestrator and every worker.
pub(crate) struct Shared {
    pub(crate) registry: Arc<dyn SessionRegistry>,
    pub(crate) checkpoints: CheckpointManager,
    pub(crate) collaborator: Arc<dyn Collaborator>,
}

/// Handle on the worker currently attached to a session.
#[derive(Default)]
pub(crate) struct WorkerRun {
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: Option<JoinHandle<()>>,
    /// `None` once the worker has published a terminal status.
    pub(crate) requests: Option<mpsc::UnboundedSender<CheckpointReply>>,
}

impl WorkerRun {
    /// Stop the attached worker without waiting for it.
    pub(crate) fn cancel(&mut self) {
        self.cancel.cancel();
        self.requests = None;
    }

    /// Stop the attached worker and wait until its task has ended.
    pub(crate) async fn stop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // A cancelled JoinError is the expected outcome here.
            let _ = handle.await;
        }
    }
}

/// Per-session lock serializing worker publishes with crash and restore.
pub(crate) type SessionGuard = Arc<Mutex<WorkerRun>>;

/// Start a worker for `state` and attach it to `run`.
///
/// The caller must hold the session guard.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    guard: SessionGuard,
    run: &mut WorkerRun,
    state: SessionState,
) {
    let cancel = CancellationToken::new();
    let (tx, requests) = mpsc::unbounded_channel();
    let span = info_span!("session_worker", session_id = %state.session_id);

    let worker = Worker {
        shared,
        guard,
        cancel: cancel.clone(),
        requests,
        state,
    };

    run.cancel = cancel;
    run.requests = Some(tx);
    run.handle = Some(tokio::spawn(worker.run().instrument(span)));
}

struct Worker {
    shared: Arc<Shared>,
    guard: SessionGuard,
    cancel: CancellationToken,
    requests: mpsc::UnboundedReceiver<CheckpointReply>,
    state: SessionState,
}

impl Worker {
    async fn run(mut self) {
        if let Err(err) = self.drive().await {
            error!(%err, "session worker stopped on an internal error");
            self.abandon(&err).await;
        }
        debug!(status = self.state.status.as_str(), "session worker exited");
    }

    async fn drive(&mut self) -> Result<()> {
        if self.state.status == SessionStatus::Starting && !self.prepare().await? {
            return Ok(());
        }

        while self.state.status == SessionStatus::Running {
            if !self.serve_checkpoint_requests().await? {
                return Ok(());
            }
            if self.state.all_steps_done() {
                return self.respond().await;
            }
            if !self.advance().await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Load context and plan. Returns `false` when the worker should stop.
    async fn prepare(&mut self) -> Result<bool> {
        let collaborator = Arc::clone(&self.shared.collaborator);

        let loaded = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(false),
            loaded = collaborator.load_context(&self.state.user_id) => loaded,
        };
        let blob = match loaded {
            Ok(blob) => blob,
            Err(err) => return self.fail_setup("load_context", &err).await,
        };

        let planned = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(false),
            planned = collaborator.plan(&self.state.task_description, &blob.data) => planned,
        };
        self.state.context = Some(blob.data);
        self.state.conflict_info = blob.conflicts;
        let steps = match planned {
            Ok(steps) => steps,
            Err(err) => return self.fail_setup("plan", &err).await,
        };

        self.state.set_plan(steps);
        if self.state.total_steps == 0 {
            self.state.final_response = Some(String::new());
            self.state.transition_to(SessionStatus::Completed)?;
            info!("plan has no steps; session completed");
            self.commit_final().await?;
            return Ok(false);
        }

        self.state.transition_to(SessionStatus::Running)?;
        if !self.commit().await? {
            return Ok(false);
        }
        info!(total_steps = self.state.total_steps, "plan ready");

        if self.shared.checkpoints.policy().on_plan_complete {
            return self.checkpoint(true).await;
        }
        Ok(true)
    }

    /// Run one step and the checkpoint that follows it.
    async fn advance(&mut self) -> Result<bool> {
        let index = step_runner::begin_step(&mut self.state)?;
        if !self.commit().await? {
            return Ok(false);
        }

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(false),
            outcome = step_runner::execute_current(
                &self.state,
                self.shared.collaborator.as_ref(),
            ) => outcome,
        };

        match step_runner::finish_step(&mut self.state, index, outcome)? {
            StepOutcome::Completed { .. } => {}
            StepOutcome::Failed { step_number, .. } => {
                self.state.transition_to(SessionStatus::Failed)?;
                warn!(step_number, "session failed on step");
                self.commit_final().await?;
                return Ok(false);
            }
        }
        if !self.commit().await? {
            return Ok(false);
        }

        self.checkpoint(false).await
    }

    /// Synthesize the final response and finish the session.
    async fn respond(&mut self) -> Result<()> {
        let collaborator = Arc::clone(&self.shared.collaborator);
        let results = self.state.prior_results();

        let synthesized = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            synthesized = collaborator.synthesize(
                &self.state.task_description,
                &results,
                self.state.conflict_info.as_ref(),
            ) => synthesized,
        };

        match synthesized {
            Ok(response) => {
                self.state.final_response = Some(response);
                self.state.transition_to(SessionStatus::Completed)?;
                info!(total_steps = self.state.total_steps, "session completed");
            }
            Err(err) => {
                warn!(%err, "synthesis failed");
                self.state.error = Some(err.to_string());
                self.state.transition_to(SessionStatus::Failed)?;
            }
        }
        self.commit_final().await?;
        Ok(())
    }

    async fn checkpoint(&mut self, boundary: bool) -> Result<bool> {
        let interval = self.shared.checkpoints.policy().interval();
        if !boundary && !is_due(&self.state, interval, Utc::now()) {
            return Ok(!self.cancel.is_cancelled());
        }
        match self.take_checkpoint().await? {
            Some(Ok(_)) => Ok(true),
            Some(Err(err)) => {
                self.shared.checkpoints.record_failure(&mut self.state, &err);
                self.commit().await
            }
            None => Ok(false),
        }
    }

    /// Take any queued manual checkpoints at this step boundary.
    async fn serve_checkpoint_requests(&mut self) -> Result<bool> {
        while let Ok(reply) = self.requests.try_recv() {
            if reply.is_closed() {
                debug!("manual checkpoint requester gave up; skipping");
                continue;
            }
            // Dropping the reply on cancellation sends the requester back
            // to the registry.
            let Some(result) = self.take_checkpoint().await? else {
                return Ok(false);
            };
            if let Err(err) = &result {
                warn!(%err, "manual checkpoint failed");
            }
            // The requester may have given up waiting.
            let _ = reply.send(result);
        }
        Ok(!self.cancel.is_cancelled())
    }

    /// Snapshot the working state, then store and publish the checkpoint.
    ///
    /// The snapshot races cancellation. The store write and publish happen
    /// under the session guard, so nothing is recorded once the session has
    /// crashed or been restored. `None` means this worker was cancelled; the
    /// inner result is the checkpoint's own outcome.
    async fn take_checkpoint(&mut self) -> Result<Option<Result<CheckpointRecord>>> {
        let prepared = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(None),
            prepared = self.shared.checkpoints.prepare_checkpoint(&self.state) => prepared,
        };
        let pending = match prepared {
            Ok(pending) => pending,
            Err(err) => return Ok(Some(Err(err))),
        };

        let _run = self.guard.lock().await;
        if self.cancel.is_cancelled() {
            debug!("session stopped during snapshot; checkpoint dropped");
            return Ok(None);
        }
        let saved = self
            .shared
            .checkpoints
            .save_checkpoint(&mut self.state, pending)
            .await;
        if saved.is_ok() {
            self.shared.registry.put(self.state.clone()).await?;
        }
        Ok(Some(saved))
    }

    async fn fail_setup(&mut self, phase: &str, err: &AppError) -> Result<bool> {
        warn!(phase, %err, "session setup failed");
        self.state.error = Some(err.to_string());
        self.state.transition_to(SessionStatus::Failed)?;
        self.commit_final().await?;
        Ok(false)
    }

    /// Best-effort move to `failed` after an internal error.
    async fn abandon(&mut self, err: &AppError) {
        if !self.state.can_transition_to(SessionStatus::Failed) {
            return;
        }
        self.state.error = Some(err.to_string());
        if self.state.transition_to(SessionStatus::Failed).is_err() {
            return;
        }
        if let Err(commit_err) = self.commit_final().await {
            error!(%commit_err, "could not record session failure");
        }
    }

    /// Publish the working state. Returns `false` if this worker was cancelled.
    async fn commit(&self) -> Result<bool> {
        let _run = self.guard.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        self.shared.registry.put(self.state.clone()).await?;
        Ok(true)
    }

    /// Publish a terminal state and stop accepting checkpoint requests.
    async fn commit_final(&self) -> Result<bool> {
        let mut run = self.guard.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        self.shared.registry.put(self.state.clone()).await?;
        run.requests = None;
        Ok(true)
    }
}
