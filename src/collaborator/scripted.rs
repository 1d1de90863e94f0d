//! Deterministic in-process collaborator.
//!
//! Plans from the numbered list in the task text (falling back to a
//! configured default plan), echoes each step as its result, and can be
//! throttled or made to fail. The `demo` command and the test suite drive
//! the engine with it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::{parse_plan, CollabFuture, Collaborator, ContextBlob, StepResult};
use crate::config::CollaboratorConfig;
use crate::AppError;

/// Scripted collaborator with step gating and failure injection.
#[derive(Debug)]
pub struct ScriptedCollaborator {
    default_plan: Vec<String>,
    step_delay: Duration,
    conflicts: Option<serde_json::Value>,
    fail_context: AtomicBool,
    fail_plan: AtomicBool,
    fail_step_containing: Mutex<Option<String>>,
    step_budget: watch::Sender<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl ScriptedCollaborator {
    /// Build a collaborator that plans `default_plan` when the task has no list.
    #[must_use]
    pub fn new(default_plan: Vec<String>) -> Self {
        let (step_budget, _) = watch::channel(usize::MAX);
        Self {
            default_plan,
            step_delay: Duration::ZERO,
            conflicts: None,
            fail_context: AtomicBool::new(false),
            fail_plan: AtomicBool::new(false),
            fail_step_containing: Mutex::new(None),
            step_budget,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Build from the `[collaborator]` config section.
    #[must_use]
    pub fn from_config(config: &CollaboratorConfig) -> Self {
        Self::new(config.default_plan.clone())
            .with_step_delay(Duration::from_millis(config.step_delay_ms))
    }

    /// Sleep this long inside every `execute_step`.
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Report this conflict summary from `load_context`.
    #[must_use]
    pub fn with_conflicts(mut self, conflicts: serde_json::Value) -> Self {
        self.conflicts = Some(conflicts);
        self
    }

    /// Make `load_context` fail.
    pub fn set_fail_context(&self, fail: bool) {
        self.fail_context.store(fail, Ordering::SeqCst);
    }

    /// Make `plan` fail.
    pub fn set_fail_plan(&self, fail: bool) {
        self.fail_plan.store(fail, Ordering::SeqCst);
    }

    /// Fail any step whose description contains `needle`.
    pub fn fail_steps_containing(&self, needle: Option<&str>) {
        *self
            .fail_step_containing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = needle.map(ToOwned::to_owned);
    }

    /// Let only steps with zero-based index below `budget` run; later
    /// steps wait inside `execute_step` until the budget grows.
    pub fn allow_steps(&self, budget: usize) {
        self.step_budget.send_replace(budget);
    }

    /// Remove any step budget.
    pub fn allow_all_steps(&self) {
        self.allow_steps(usize::MAX);
    }

    /// Descriptions of every step execution started, in call order.
    #[must_use]
    pub fn executed_steps(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Highest number of simultaneous `execute_step` calls observed.
    #[must_use]
    pub fn max_concurrent_steps(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail_step(&self, description: &str) -> bool {
        self.fail_step_containing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_deref()
            .is_some_and(|needle| description.contains(needle))
    }
}

impl Default for ScriptedCollaborator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Decrements the in-flight counter even when the step future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Collaborator for ScriptedCollaborator {
    fn load_context(&self, user_id: &str) -> CollabFuture<'_, ContextBlob> {
        let user_id = user_id.to_owned();
        Box::pin(async move {
            if self.fail_context.load(Ordering::SeqCst) {
                return Err(AppError::Collaborator("context service unavailable".into()));
            }
            Ok(ContextBlob {
                data: serde_json::json!({
                    "user_id": user_id,
                    "preferences": [],
                    "constraints": [],
                    "goals": [],
                }),
                conflicts: self.conflicts.clone(),
            })
        })
    }

    fn plan(&self, task: &str, _context: &serde_json::Value) -> CollabFuture<'_, Vec<String>> {
        let task = task.to_owned();
        Box::pin(async move {
            if self.fail_plan.load(Ordering::SeqCst) {
                return Err(AppError::Collaborator("planner unavailable".into()));
            }
            let steps = parse_plan(&task);
            if steps.is_empty() {
                Ok(self.default_plan.clone())
            } else {
                Ok(steps)
            }
        })
    }

    fn execute_step(
        &self,
        step_description: &str,
        _context: &serde_json::Value,
        prior_results: &[serde_json::Value],
    ) -> CollabFuture<'_, StepResult> {
        let description = step_description.to_owned();
        let index = prior_results.len();
        Box::pin(async move {
            let mut budget = self.step_budget.subscribe();
            budget
                .wait_for(|allowed| index < *allowed)
                .await
                .map_err(|err| AppError::Collaborator(format!("step gate closed: {err}")))?;

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.executed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(description.clone());
            debug!(index, description, "executing scripted step");

            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }

            if self.should_fail_step(&description) {
                return Err(AppError::Collaborator(format!(
                    "step failed: {description}"
                )));
            }

            Ok(StepResult::new(serde_json::json!({
                "step": description,
                "output": format!("done: {description}"),
            })))
        })
    }

    fn synthesize(
        &self,
        task: &str,
        step_results: &[serde_json::Value],
        conflict_info: Option<&serde_json::Value>,
    ) -> CollabFuture<'_, String> {
        let mut response = format!(
            "Completed \"{task}\" in {} step(s).",
            step_results.len()
        );
        for result in step_results {
            if let Some(output) = result.get("output").and_then(serde_json::Value::as_str) {
                response.push_str("\n- ");
                response.push_str(output);
            }
        }
        if let Some(conflict) = conflict_info {
            response.push_str(&format!("\nConflicts considered: {conflict}"));
        }
        Box::pin(async move { Ok(response) })
    }
}
