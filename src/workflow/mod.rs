//! Durable workflow that turns one user message into a saved fragment.

pub mod context;
pub mod durable;
pub mod orchestrator;

pub use context::{ContextBudget, LoadedContext};
pub use durable::{CANCELLED_REASON, PartialCheckpoint, RetryPolicy, StepRunner, TIMED_OUT_REASON};
pub use orchestrator::{
    EMPTY_RESULT_MESSAGE, Orchestrator, OrchestratorSettings, Submission, WorkflowInput, WorkflowOutput,
};
