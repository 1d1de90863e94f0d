//! Unit tests for checkpoint policy, restore, and crash simulation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use phoenix_engine::config::{CheckpointConfig, SnapshotConfig};
use phoenix_engine::models::session::{SessionState, SessionStatus};
use phoenix_engine::orchestrator::checkpoint_manager::is_due;
use phoenix_engine::orchestrator::{CheckpointManager, InMemorySessionRegistry, SessionRegistry};
use phoenix_engine::persistence::checkpoint_repo::CheckpointRepo;
use phoenix_engine::persistence::db;
use phoenix_engine::snapshot::SimulatedSnapshotBackend;
use phoenix_engine::AppError;

struct Fixture {
    manager: CheckpointManager,
    backend: Arc<SimulatedSnapshotBackend>,
    registry: InMemorySessionRegistry,
    repo: CheckpointRepo,
}

async fn fixture() -> Fixture {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let repo = CheckpointRepo::new(db);
    let backend = Arc::new(SimulatedSnapshotBackend::new());
    let policy = CheckpointConfig {
        failure_escalation_threshold: 2,
        ..CheckpointConfig::default()
    };
    let manager = CheckpointManager::new(
        repo.clone(),
        backend.clone(),
        SnapshotConfig::default(),
        policy,
    );
    Fixture {
        manager,
        backend,
        registry: InMemorySessionRegistry::new(),
        repo,
    }
}

/// A running session with the first `finished` of three steps done.
fn running_at(finished: usize) -> SessionState {
    let mut state = SessionState::new("Plan a trip".into(), "u1".into());
    state.set_plan(vec!["a".into(), "b".into(), "c".into()]);
    state.status = SessionStatus::Running;
    for step in state.steps.iter_mut().take(finished) {
        step.start().expect("start");
        step.complete(serde_json::json!("ok")).expect("complete");
    }
    state.current_step_index = finished;
    state
}

// ── Interval gate ────────────────────────────────────────────

#[test]
fn never_checkpointed_session_is_due() {
    let state = running_at(0);
    assert!(is_due(&state, Duration::from_secs(3600), Utc::now()));
}

#[test]
fn due_only_after_interval_elapses() {
    let mut state = running_at(0);
    let now = Utc::now();
    state.last_checkpoint_at = Some(now - chrono::Duration::seconds(10));

    assert!(!is_due(&state, Duration::from_secs(30), now));
    assert!(is_due(&state, Duration::from_secs(10), now));
    assert!(is_due(&state, Duration::ZERO, now));
}

#[test]
fn clock_going_backwards_is_not_due() {
    let mut state = running_at(0);
    let now = Utc::now();
    state.last_checkpoint_at = Some(now + chrono::Duration::seconds(5));
    assert!(!is_due(&state, Duration::from_secs(1), now));
}

// ── Creation ─────────────────────────────────────────────────

#[tokio::test]
async fn create_updates_bookkeeping_and_captures_it() {
    let f = fixture().await;
    let mut state = running_at(1);

    let record = f.manager.create_checkpoint(&mut state).await.expect("create");

    assert_eq!(state.checkpoint_count, 1);
    assert!(state.last_checkpoint_at.is_some());
    assert_eq!(record.step_number, 1);
    let captured = record.rehydrate().expect("rehydrate");
    assert_eq!(captured.checkpoint_count, 1);
    assert_eq!(captured.last_checkpoint_at, state.last_checkpoint_at);
    assert_eq!(f.backend.created_count(), 1);
}

#[tokio::test]
async fn create_refuses_step_in_progress() {
    let f = fixture().await;
    let mut state = running_at(1);
    state.steps[1].start().expect("start");

    let err = f.manager.create_checkpoint(&mut state).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert_eq!(f.backend.created_count(), 0);
}

#[tokio::test]
async fn prepared_checkpoint_is_stored_only_when_saved() {
    let f = fixture().await;
    let mut state = running_at(1);

    let dropped = f.manager.prepare_checkpoint(&state).await.expect("prepare");
    assert_eq!(dropped.record().step_number, 1);
    drop(dropped);
    assert_eq!(f.repo.count().await.unwrap(), 0);
    assert_eq!(state.checkpoint_count, 0);

    let pending = f.manager.prepare_checkpoint(&state).await.expect("prepare");
    let id = pending.record().checkpoint_id.clone();
    let saved = f
        .manager
        .save_checkpoint(&mut state, pending)
        .await
        .expect("save");
    assert_eq!(saved.checkpoint_id, id);
    assert_eq!(state.checkpoint_count, 1);
    assert_eq!(f.repo.count().await.unwrap(), 1);
    assert_eq!(f.backend.created_count(), 2);
}

#[tokio::test]
async fn save_rejects_checkpoint_of_another_session() {
    let f = fixture().await;
    let state = running_at(1);
    let mut other = running_at(1);

    let pending = f.manager.prepare_checkpoint(&state).await.expect("prepare");
    let err = f
        .manager
        .save_checkpoint(&mut other, pending)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert_eq!(f.repo.count().await.unwrap(), 0);
}

#[tokio::test]
async fn maybe_checkpoint_respects_interval_unless_boundary() {
    let f = fixture().await;
    let mut state = running_at(0);
    let hour = Duration::from_secs(3600);

    assert!(f.manager.maybe_checkpoint(&mut state, hour, false).await.is_some());
    assert!(f.manager.maybe_checkpoint(&mut state, hour, false).await.is_none());
    assert!(f.manager.maybe_checkpoint(&mut state, hour, true).await.is_some());
    assert_eq!(state.checkpoint_count, 2);
}

#[tokio::test]
async fn maybe_checkpoint_swallows_and_counts_failures() {
    let f = fixture().await;
    f.backend.set_fail_create(true);
    let mut state = running_at(0);

    for expected in 1..=3 {
        let record = f
            .manager
            .maybe_checkpoint(&mut state, Duration::ZERO, false)
            .await;
        assert!(record.is_none());
        assert_eq!(state.consecutive_checkpoint_failures, expected);
    }
    assert_eq!(state.checkpoint_count, 0);
    assert_eq!(f.repo.count().await.unwrap(), 0);

    f.backend.set_fail_create(false);
    f.manager
        .maybe_checkpoint(&mut state, Duration::ZERO, false)
        .await
        .expect("recovers");
    assert_eq!(state.consecutive_checkpoint_failures, 0);
}

// ── Restore ──────────────────────────────────────────────────

#[tokio::test]
async fn restore_rebuilds_running_session() {
    let f = fixture().await;
    let mut state = running_at(2);
    let record = f.manager.create_checkpoint(&mut state).await.expect("create");

    state.transition_to(SessionStatus::Crashed).expect("crash");
    f.registry.put(state.clone()).await.unwrap();

    let restored = f
        .manager
        .restore(Some(&record.checkpoint_id), &f.registry)
        .await
        .expect("restore");

    assert_eq!(restored.state.status, SessionStatus::Running);
    assert_eq!(restored.state.current_step_index, 2);
    assert_eq!(restored.checkpoint.checkpoint_id, record.checkpoint_id);
    assert_eq!(f.backend.restored_refs(), vec![record.snapshot_ref]);

    let registered = f.registry.get(&state.session_id).await.unwrap().unwrap();
    assert_eq!(registered, restored.state);
}

#[tokio::test]
async fn restore_of_unregistered_session_recreates_it() {
    let f = fixture().await;
    let mut state = running_at(1);
    f.manager.create_checkpoint(&mut state).await.expect("create");

    let restored = f.manager.restore(None, &f.registry).await.expect("restore");
    assert_eq!(restored.state.session_id, state.session_id);
    assert!(f.registry.get(&state.session_id).await.unwrap().is_some());
}

#[tokio::test]
async fn restore_of_active_session_conflicts() {
    let f = fixture().await;
    let mut state = running_at(1);
    f.manager.create_checkpoint(&mut state).await.expect("create");
    f.registry.put(state.clone()).await.unwrap();

    let err = f.manager.restore(None, &f.registry).await.unwrap_err();
    assert!(matches!(err, AppError::RestoreConflict(_)));
    assert!(f.backend.restored_refs().is_empty());
}

#[tokio::test]
async fn restore_with_no_checkpoints_is_not_found() {
    let f = fixture().await;
    let err = f.manager.restore(None, &f.registry).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(err.to_string().contains("no checkpoints available"));
}

#[tokio::test]
async fn restore_clears_terminal_outcome_fields() {
    let f = fixture().await;
    let mut state = running_at(1);
    f.manager.create_checkpoint(&mut state).await.expect("create");

    let mut failed = state.clone();
    failed.error = Some("boom".into());
    failed.transition_to(SessionStatus::Failed).expect("fail");
    f.registry.put(failed).await.unwrap();

    let restored = f.manager.restore(None, &f.registry).await.expect("restore");
    assert!(restored.state.error.is_none());
    assert!(restored.state.final_response.is_none());
}

// ── Crash ────────────────────────────────────────────────────

#[tokio::test]
async fn crash_marks_running_session_crashed() {
    let f = fixture().await;
    let state = running_at(1);
    f.registry.put(state.clone()).await.unwrap();

    let crashed = f
        .manager
        .simulate_crash(&state.session_id, &f.registry)
        .await
        .expect("crash");
    assert_eq!(crashed.status, SessionStatus::Crashed);
    assert_eq!(
        f.backend.discarded_containers(),
        vec![format!("phoenix-agent-{}", state.session_id)]
    );
}

#[tokio::test]
async fn crash_requires_running_session() {
    let f = fixture().await;
    let mut state = running_at(3);
    state.transition_to(SessionStatus::Completed).expect("complete");
    f.registry.put(state.clone()).await.unwrap();

    let err = f
        .manager
        .simulate_crash(&state.session_id, &f.registry)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert!(f.backend.discarded_containers().is_empty());

    let err = f
        .manager
        .simulate_crash("missing", &f.registry)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

// ── Deletion ─────────────────────────────────────────────────

#[tokio::test]
async fn delete_session_checkpoints_removes_all() {
    let f = fixture().await;
    let mut state = running_at(0);
    f.manager.create_checkpoint(&mut state).await.expect("create");
    f.manager.create_checkpoint(&mut state).await.expect("create");

    assert_eq!(f.manager.session_checkpoints(&state.session_id).await.unwrap().len(), 2);
    assert_eq!(
        f.manager
            .delete_session_checkpoints(&state.session_id)
            .await
            .unwrap(),
        2
    );
    assert_eq!(f.manager.checkpoint_count().await.unwrap(), 0);
}
