//! Unit tests for `SessionState` transitions and resumability checks.

use phoenix_engine::models::session::{SessionState, SessionStatus};
use phoenix_engine::models::step::StepStatus;
use phoenix_engine::AppError;

fn planned(steps: &[&str]) -> SessionState {
    let mut state = SessionState::new("task".into(), "u1".into());
    state.set_plan(steps.iter().map(|s| (*s).to_owned()).collect());
    state
}

/// Finish the first `n` steps as completed.
fn finish_first(state: &mut SessionState, n: usize) {
    for step in state.steps.iter_mut().take(n) {
        let number = step.step_number;
        step.start().expect("start");
        step.complete(serde_json::json!({ "step": number }))
            .expect("complete");
    }
    state.current_step_index = n;
}

#[test]
fn new_session_starts_empty() {
    let state = SessionState::new("Plan a trip".into(), "u1".into());
    assert_eq!(state.status, SessionStatus::Starting);
    assert!(state.steps.is_empty());
    assert_eq!(state.current_step_index, 0);
    assert_eq!(state.checkpoint_count, 0);
    assert!(!state.session_id.is_empty());
}

#[test]
fn session_ids_are_unique() {
    let a = SessionState::new("t".into(), "u".into());
    let b = SessionState::new("t".into(), "u".into());
    assert_ne!(a.session_id, b.session_id);
}

#[test]
fn set_plan_numbers_steps_from_one() {
    let state = planned(&["a", "b", "c"]);
    assert_eq!(state.total_steps, 3);
    let numbers: Vec<u32> = state.steps.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
}

#[test]
fn allowed_transitions() {
    let mut state = planned(&["a"]);
    state.transition_to(SessionStatus::Running).expect("start");
    state.transition_to(SessionStatus::Crashed).expect("crash");
    state.transition_to(SessionStatus::Running).expect("restore");
    state.transition_to(SessionStatus::Failed).expect("fail");
    state.transition_to(SessionStatus::Running).expect("restore failed");
    state.transition_to(SessionStatus::Completed).expect("complete");
}

#[test]
fn crashed_is_reachable_only_from_running() {
    let mut state = planned(&["a"]);
    let err = state.transition_to(SessionStatus::Crashed).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    state.status = SessionStatus::Completed;
    assert!(!state.can_transition_to(SessionStatus::Crashed));
    assert!(!state.can_transition_to(SessionStatus::Running));
}

#[test]
fn restorable_statuses() {
    assert!(SessionStatus::Crashed.is_restorable());
    assert!(SessionStatus::Failed.is_restorable());
    assert!(!SessionStatus::Running.is_restorable());
    assert!(!SessionStatus::Completed.is_restorable());
    assert!(!SessionStatus::Starting.is_restorable());
}

#[test]
fn prior_results_cover_steps_before_index() {
    let mut state = planned(&["a", "b", "c"]);
    finish_first(&mut state, 2);
    let prior = state.prior_results();
    assert_eq!(prior.len(), 2);
    assert_eq!(prior[1]["step"], 2);
    assert_eq!(state.current_step().unwrap().description, "c");
    assert!(!state.all_steps_done());
}

#[test]
fn resumable_when_prefix_finished() {
    let mut state = planned(&["a", "b", "c"]);
    finish_first(&mut state, 2);
    state.check_resumable_at(2).expect("resumable");
}

#[test]
fn not_resumable_with_index_mismatch() {
    let mut state = planned(&["a", "b", "c"]);
    finish_first(&mut state, 2);
    assert!(state.check_resumable_at(1).is_err());
    assert!(state.check_resumable_at(4).is_err());
}

#[test]
fn not_resumable_with_unfinished_prefix_or_step_in_progress() {
    let mut state = planned(&["a", "b", "c"]);
    state.current_step_index = 1;
    assert!(state.check_resumable_at(1).is_err());

    let mut state = planned(&["a", "b", "c"]);
    finish_first(&mut state, 1);
    state.steps[1].start().expect("start");
    assert!(state.has_step_in_progress());
    assert!(state.check_resumable_at(1).is_err());
}

#[test]
fn session_status_serializes_snake_case() {
    let json = serde_json::to_string(&SessionStatus::Crashed).expect("serialize");
    assert_eq!(json, "\"crashed\"");
    assert_eq!(SessionStatus::Running.as_str(), "running");
}

#[test]
fn summary_mirrors_state() {
    let mut state = planned(&["a", "b"]);
    finish_first(&mut state, 1);
    let summary = state.summary();
    assert_eq!(summary.session_id, state.session_id);
    assert_eq!(summary.current_step_index, 1);
    assert_eq!(summary.total_steps, 2);
}
