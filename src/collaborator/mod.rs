//! External planning, execution, and context collaborators.
//!
//! The engine never plans or executes work itself. It drives a
//! [`Collaborator`] through load-context, plan, execute-step, and
//! synthesize calls and treats every payload as opaque JSON.

pub mod plan;
pub mod scripted;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::Result;

pub use plan::parse_plan;
pub use scripted::ScriptedCollaborator;

/// Boxed future returned by collaborator operations.
pub type CollabFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Preference, constraint, and goal data loaded for a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub struct ContextBlob {
    /// Opaque context payload handed back to planning and execution.
    pub data: serde_json::Value,
    /// Conflict-resolution summary; stored on the session verbatim.
    pub conflicts: Option<serde_json::Value>,
}

/// Output of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct StepResult {
    /// Opaque step output recorded on the step.
    pub output: serde_json::Value,
    /// Replacement conflict summary, when execution detected one.
    pub conflict: Option<serde_json::Value>,
}

impl StepResult {
    /// A result with no conflict update.
    #[must_use]
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            conflict: None,
        }
    }
}

/// Generative planning/execution and context services consumed by the engine.
///
/// Every method may fail with
/// [`AppError::Collaborator`](crate::AppError::Collaborator); the engine
/// records the failure and never retries implicitly.
pub trait Collaborator: Send + Sync {
    /// Load preference/constraint/goal data for `user_id`.
    fn load_context(&self, user_id: &str) -> CollabFuture<'_, ContextBlob>;

    /// Turn a task into ordered step descriptions.
    fn plan(&self, task: &str, context: &serde_json::Value) -> CollabFuture<'_, Vec<String>>;

    /// Execute one step given the results of all earlier steps.
    fn execute_step(
        &self,
        step_description: &str,
        context: &serde_json::Value,
        prior_results: &[serde_json::Value],
    ) -> CollabFuture<'_, StepResult>;

    /// Produce the final response from all step results.
    fn synthesize(
        &self,
        task: &str,
        step_results: &[serde_json::Value],
        conflict_info: Option<&serde_json::Value>,
    ) -> CollabFuture<'_, String>;
}
