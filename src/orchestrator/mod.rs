//! Session orchestration modules.
//!
//! Covers the session registry, single-step execution, checkpoint
//! creation/restore, the per-session background worker, and the
//! orchestrator that ties them together.

pub mod checkpoint_manager;
pub mod engine;
pub mod registry;
pub mod step_runner;
mod worker;

pub use checkpoint_manager::{CheckpointManager, PendingCheckpoint, RestoredSession};
pub use engine::{DemoStatus, RestoreOutcome, TaskOrchestrator};
pub use registry::{InMemorySessionRegistry, SessionRegistry};
