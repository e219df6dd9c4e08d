//! Typed error hierarchy for Forge Studio.
//!
//! One enum per subsystem:
//! - `ProviderError`: sandbox provider calls (transient class)
//! - `SandboxError`: lifecycle manager failures
//! - `NetworkError`: agent network parse/transition failures
//! - `WorkflowError`: durable step execution failures
//! - `WebhookError`: inbound lifecycle webhook rejections

use thiserror::Error;

use crate::network::state::Stage;

/// Errors returned by a `SandboxProvider`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Sandbox {sandbox_id} not found at provider")]
    NotFound { sandbox_id: String },

    #[error("Sandbox provider unreachable: {0}")]
    Unreachable(String),

    #[error("Sandbox provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Whether the provider could not be reached at all (as opposed to
    /// answering with an error).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_))
    }
}

/// Errors from the sandbox lifecycle manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to create sandbox for project {project_id}: {source}")]
    CreateFailed {
        project_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("No sandbox tracked for project {project_id}")]
    NotTracked { project_id: String },

    #[error("Sandbox record for project {project_id} kept changing during reconciliation")]
    Contention { project_id: String },

    #[error("Sandbox provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from the plan/execute/review state machine.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Planner output could not be parsed: {message}")]
    PlanParse { message: String },

    #[error("Reviewer output could not be parsed: {message}")]
    ReviewParse { message: String },

    #[error("Invalid stage transition {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Agent model call failed: {0}")]
    Model(#[source] anyhow::Error),

    #[error("Failed to save agent network progress: {0}")]
    Progress(#[source] anyhow::Error),
}

/// Errors from durable workflow execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workflow cancelled before step {step}")]
    Cancelled { step: String },

    #[error("Step {step} timed out after {secs}s")]
    StepTimeout { step: String, secs: u64 },

    #[error("Step {step} failed after {attempts} attempt(s): {source:#}")]
    StepFailed {
        step: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Whether the engine's retry policy may re-attempt the failing step.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, WorkflowError::Config(_) | WorkflowError::Cancelled { .. })
    }
}

/// Reasons a lifecycle webhook is rejected before it reaches the manager.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing webhook signature")]
    MissingSignature,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    Malformed(String),
}
