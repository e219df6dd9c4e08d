//! The agent call boundary.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Coder,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: AgentRole,
    pub model: String,
    pub system: String,
    pub prompt: String,
}

#[async_trait]
pub trait AgentModel: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// Calls the `claude` CLI in print mode.
pub struct ClaudeCliModel {
    claude_cmd: String,
    working_dir: Option<PathBuf>,
}

impl ClaudeCliModel {
    pub fn new(claude_cmd: impl Into<String>) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl AgentModel for ClaudeCliModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let mut cmd = Command::new(&self.claude_cmd);
        cmd.args([
            "--print",
            "--output-format",
            "text",
            "--model",
            request.model.as_str(),
            "--system-prompt",
            request.system.as_str(),
            "-p",
            request.prompt.as_str(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(role = request.role.as_str(), model = %request.model, prompt_chars = request.prompt.len(), "calling claude");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {} for the {}", self.claude_cmd, request.role.as_str()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Claude {} failed: {}", request.role.as_str(), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Replays canned responses per role, in order.
///
/// File format: `{"planner": ["..."], "coder": ["...", "..."], "reviewer": ["..."]}`.
#[derive(Default)]
pub struct ReplayModel {
    responses: Mutex<HashMap<AgentRole, VecDeque<String>>>,
}

impl ReplayModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?;
        let parsed: HashMap<AgentRole, Vec<String>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse replay file {}", path.display()))?;
        let model = Self::new();
        for (role, responses) in parsed {
            for response in responses {
                model.push(role, response);
            }
        }
        Ok(model)
    }

    pub fn push(&self, role: AgentRole, response: impl Into<String>) -> &Self {
        self.lock()
            .entry(role)
            .or_default()
            .push_back(response.into());
        self
    }

    pub fn remaining(&self, role: AgentRole) -> usize {
        self.lock().get(&role).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AgentRole, VecDeque<String>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AgentModel for ReplayModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        match self.lock().get_mut(&request.role).and_then(VecDeque::pop_front) {
            Some(response) => Ok(response),
            None => bail!("Replay has no {} responses left", request.role.as_str()),
        }
    }
}
