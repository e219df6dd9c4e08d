use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named step of a workflow run. The first seven are workflow steps (one
/// record per workflow); the last three are tool calls made inside
/// `NetworkRun` (one record per call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKey {
    Reset,
    LoadContext,
    GetSandbox,
    Hydrate,
    NetworkRun,
    GetUrl,
    SaveResult,
    Terminal,
    WriteFiles,
    ReadFiles,
}

impl ActionKey {
    /// Keys recorded once per tool call.
    pub const TOOLS: [ActionKey; 3] = [Self::Terminal, Self::WriteFiles, Self::ReadFiles];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "RESET",
            Self::LoadContext => "LOAD_CONTEXT",
            Self::GetSandbox => "GET_SANDBOX",
            Self::Hydrate => "HYDRATE",
            Self::NetworkRun => "NETWORK_RUN",
            Self::GetUrl => "GET_URL",
            Self::SaveResult => "SAVE_RESULT",
            Self::Terminal => "TERMINAL",
            Self::WriteFiles => "WRITE_FILES",
            Self::ReadFiles => "READ_FILES",
        }
    }

    /// Workflow-level steps are unique per workflow; tool keys are not.
    pub fn is_step(&self) -> bool {
        !matches!(self, Self::Terminal | Self::WriteFiles | Self::ReadFiles)
    }

    /// Human-readable label shown by the UI while the step runs.
    pub fn default_label(&self) -> &'static str {
        match self {
            Self::Reset => "Preparing run",
            Self::LoadContext => "Loading conversation",
            Self::GetSandbox => "Starting sandbox",
            Self::Hydrate => "Restoring files",
            Self::NetworkRun => "Building",
            Self::GetUrl => "Resolving preview",
            Self::SaveResult => "Saving result",
            Self::Terminal => "Running command",
            Self::WriteFiles => "Writing files",
            Self::ReadFiles => "Reading files",
        }
    }
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESET" => Ok(Self::Reset),
            "LOAD_CONTEXT" => Ok(Self::LoadContext),
            "GET_SANDBOX" => Ok(Self::GetSandbox),
            "HYDRATE" => Ok(Self::Hydrate),
            "NETWORK_RUN" => Ok(Self::NetworkRun),
            "GET_URL" => Ok(Self::GetUrl),
            "SAVE_RESULT" => Ok(Self::SaveResult),
            "TERMINAL" => Ok(Self::Terminal),
            "WRITE_FILES" => Ok(Self::WriteFiles),
            "READ_FILES" => Ok(Self::ReadFiles),
            _ => Err(format!("Invalid action key: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Running,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid action status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub project_id: String,
    pub workflow_id: String,
    pub key: ActionKey,
    pub label: String,
    pub detail: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: ActionStatus,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Rewrite of a record's `detail`/`metadata` when it is finalised.
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionUpdate {
    pub detail: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ActionUpdate {
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
