//! Integration tests for checkpoint creation through the orchestrator.
//!
//! Validates:
//! - Per-session `step_number` never decreases in creation order
//! - The interval gate and plan-completion boundary checkpoint
//! - Snapshot backend failures never fail or block the session
//! - Manual checkpoints on running, finished, and crashed sessions
//! - A manual checkpoint gives up when no step boundary arrives in time
//! - Listing, fetching, and deleting checkpoints

use std::sync::Arc;
use std::time::Duration;

use phoenix_engine::collaborator::ScriptedCollaborator;
use phoenix_engine::models::session::SessionStatus;
use phoenix_engine::AppError;

use super::test_helpers::{
    harness, harness_with, test_config, wait_blocked_at, wait_terminal, FIVE_STEP_TASK,
};

#[tokio::test]
async fn checkpoint_step_numbers_are_monotonic() {
    let h = harness().await;
    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    let done = wait_terminal(&h.orchestrator, &session_id).await;

    let checkpoints = h.repo.list_for_session(&session_id).await.unwrap();
    let numbers: Vec<usize> = checkpoints.iter().map(|c| c.step_number).collect();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
    assert!(checkpoints.iter().all(|c| c.total_steps == 5));
    assert_eq!(done.checkpoint_count, 6);
    assert!(done.last_checkpoint_at.is_some());
}

#[tokio::test]
async fn interval_gate_limits_automatic_checkpoints() {
    let mut config = test_config();
    config.checkpoint.interval_seconds = 3600;
    let h = harness_with(config, ScriptedCollaborator::default()).await;

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_terminal(&h.orchestrator, &session_id).await;

    // Only the plan-completion boundary checkpoint bypasses the gate.
    let checkpoints = h.repo.list_for_session(&session_id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].step_number, 0);
}

#[tokio::test]
async fn plan_boundary_checkpoint_can_be_disabled() {
    let mut config = test_config();
    config.checkpoint.interval_seconds = 3600;
    config.checkpoint.on_plan_complete = false;
    let h = harness_with(config, ScriptedCollaborator::default()).await;

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_terminal(&h.orchestrator, &session_id).await;

    // First step is due because the session was never checkpointed.
    let checkpoints = h.repo.list_for_session(&session_id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].step_number, 1);
}

#[tokio::test]
async fn snapshot_failures_do_not_fail_the_session() {
    let h = harness().await;
    h.backend.set_fail_create(true);

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    let done = wait_terminal(&h.orchestrator, &session_id).await;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.checkpoint_count, 0);
    assert_eq!(done.consecutive_checkpoint_failures, 6);
    assert_eq!(h.repo.count().await.unwrap(), 0);
}

#[tokio::test]
async fn failure_count_resets_after_a_successful_checkpoint() {
    let h = harness().await;
    h.backend.set_fail_create(true);
    h.collaborator.allow_steps(2);

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    let blocked = wait_blocked_at(&h.orchestrator, &session_id, 2).await;
    assert_eq!(blocked.consecutive_checkpoint_failures, 3);

    h.backend.set_fail_create(false);
    h.collaborator.allow_all_steps();
    let done = wait_terminal(&h.orchestrator, &session_id).await;

    assert_eq!(done.consecutive_checkpoint_failures, 0);
    assert_eq!(done.checkpoint_count, 3);
    let numbers: Vec<usize> = h
        .repo
        .list_for_session(&session_id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.step_number)
        .collect();
    assert_eq!(numbers, vec![3, 4, 5]);
}

#[tokio::test]
async fn manual_checkpoint_of_running_session_waits_for_step_boundary() {
    let mut config = test_config();
    config.checkpoint.interval_seconds = 3600;
    let h = harness_with(config, ScriptedCollaborator::default()).await;
    h.collaborator.allow_steps(1);

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_blocked_at(&h.orchestrator, &session_id, 1).await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let id = session_id.clone();
    let pending = tokio::spawn(async move { orchestrator.create_checkpoint(&id).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    h.collaborator.allow_steps(2);
    let record = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("checkpoint before timeout")
        .expect("task joined")
        .expect("checkpoint created");

    assert_eq!(record.session_id, session_id);
    assert_eq!(record.step_number, 2);
    let state = record.rehydrate().unwrap();
    assert!(!state.has_step_in_progress());

    h.collaborator.allow_all_steps();
    let done = wait_terminal(&h.orchestrator, &session_id).await;
    assert_eq!(done.checkpoint_count, 2);
}

#[tokio::test]
async fn manual_checkpoint_times_out_on_a_blocked_step() {
    let mut config = test_config();
    config.checkpoint.manual_timeout_seconds = 1;
    let h = harness_with(config, ScriptedCollaborator::default()).await;
    h.collaborator.allow_steps(1);

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_blocked_at(&h.orchestrator, &session_id, 1).await;

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        h.orchestrator.create_checkpoint(&session_id),
    )
    .await
    .expect("call returns once its wait expires")
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert!(err.to_string().contains("step boundary"));

    let state = h.orchestrator.get_status(&session_id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Running);

    // The abandoned request is not served later.
    h.collaborator.allow_all_steps();
    let done = wait_terminal(&h.orchestrator, &session_id).await;
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(h.repo.list_for_session(&session_id).await.unwrap().len(), 6);
    assert_eq!(done.checkpoint_count, 6);
}

#[tokio::test]
async fn manual_checkpoint_of_finished_session_is_immediate() {
    let h = harness().await;
    let session_id = h.orchestrator.start("1. only", "u1").await.unwrap();
    let done = wait_terminal(&h.orchestrator, &session_id).await;

    let record = h.orchestrator.create_checkpoint(&session_id).await.unwrap();
    assert_eq!(record.step_number, 1);
    assert_eq!(record.total_steps, 1);

    let after = h.orchestrator.get_status(&session_id).await.unwrap();
    assert_eq!(after.checkpoint_count, done.checkpoint_count + 1);
}

#[tokio::test]
async fn manual_checkpoint_of_crashed_or_unknown_session_fails() {
    let h = harness().await;
    h.collaborator.allow_steps(1);

    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_blocked_at(&h.orchestrator, &session_id, 1).await;
    h.orchestrator.simulate_crash(&session_id).await.unwrap();

    let err = h
        .orchestrator
        .create_checkpoint(&session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let err = h.orchestrator.create_checkpoint("missing").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn manual_checkpoint_backend_failure_is_reported() {
    let h = harness().await;
    let session_id = h.orchestrator.start("1. only", "u1").await.unwrap();
    wait_terminal(&h.orchestrator, &session_id).await;

    h.backend.set_fail_create(true);
    let err = h
        .orchestrator
        .create_checkpoint(&session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Snapshot(_)));
}

#[tokio::test]
async fn list_get_and_delete_checkpoints() {
    let h = harness().await;
    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_terminal(&h.orchestrator, &session_id).await;

    let newest = h.orchestrator.list_checkpoints(2).await.unwrap();
    assert_eq!(newest.len(), 2);
    assert_eq!(newest[0].step_number, 5);
    assert_eq!(newest[1].step_number, 4);

    let fetched = h
        .orchestrator
        .get_checkpoint(&newest[0].checkpoint_id)
        .await
        .unwrap();
    assert_eq!(fetched, newest[0]);

    assert!(h
        .orchestrator
        .delete_checkpoint(&newest[0].checkpoint_id)
        .await
        .unwrap());
    assert!(!h
        .orchestrator
        .delete_checkpoint(&newest[0].checkpoint_id)
        .await
        .unwrap());
    assert!(matches!(
        h.orchestrator.get_checkpoint(&newest[0].checkpoint_id).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(h.orchestrator.list_checkpoints(10).await.unwrap().len(), 5);
}

#[tokio::test]
async fn demo_status_reports_counts() {
    let h = harness().await;
    let empty = h.orchestrator.demo_status().await.unwrap();
    assert_eq!(empty.checkpoints_available, 0);
    assert!(!empty.ready_for_demo);

    h.collaborator.allow_steps(1);
    let session_id = h.orchestrator.start(FIVE_STEP_TASK, "u1").await.unwrap();
    wait_blocked_at(&h.orchestrator, &session_id, 1).await;
    h.orchestrator.simulate_crash(&session_id).await.unwrap();

    let status = h.orchestrator.demo_status().await.unwrap();
    // Nothing moves while the session is crashed.
    assert_eq!(h.orchestrator.demo_status().await.unwrap(), status);
    assert_eq!(status.checkpoints_available, 2);
    assert!(status.ready_for_demo);
    assert_eq!(status.sessions, 1);
    assert_eq!(status.crashed, 1);
    assert_eq!(status.running, 0);
    assert_eq!(status.latest_checkpoint.unwrap().step_number, 1);
}
