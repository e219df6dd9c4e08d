//! Executor tool calls: parsing a coder turn, running its tool calls
//! against the sandbox, and folding the results back into the state.

use std::collections::BTreeMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::state::AgentNetworkState;
use crate::ledger::models::{ActionKey, ActionUpdate};
use crate::ledger::{ActionContext, ActionLedger, ActionSpec};
use crate::sandbox::{CommandOutput, SandboxManager};
use crate::util::{extract_json_object, truncate_chars};

const SUMMARY_OPEN: &str = "<task_summary>";
const SUMMARY_CLOSE: &str = "</task_summary>";

/// Longest command output echoed back to the model.
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool")]
pub enum ToolCall {
    #[serde(rename = "terminal")]
    Terminal { command: String },
    #[serde(rename = "createOrUpdateFiles")]
    CreateOrUpdateFiles { files: Vec<FileWrite> },
    #[serde(rename = "readFiles")]
    ReadFiles { paths: Vec<String> },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Terminal { .. } => "terminal",
            ToolCall::CreateOrUpdateFiles { .. } => "createOrUpdateFiles",
            ToolCall::ReadFiles { .. } => "readFiles",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TurnPayload {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

/// One parsed coder response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorTurn {
    pub tool_calls: Vec<ToolCall>,
    pub final_answer: Option<String>,
}

/// Extract tool calls and the final-answer marker from a coder response.
///
/// Text that is neither is ignored; an unparsable tool payload yields no
/// tool calls rather than an error.
pub fn parse_turn(raw: &str) -> ExecutorTurn {
    let final_answer = raw.find(SUMMARY_OPEN).and_then(|start| {
        let body = &raw[start + SUMMARY_OPEN.len()..];
        body.find(SUMMARY_CLOSE).map(|end| body[..end].trim().to_string())
    });

    // The marker may itself contain braces; only look for tool calls outside it.
    let outside = match raw.find(SUMMARY_OPEN) {
        Some(start) => &raw[..start],
        None => raw,
    };
    let tool_calls = extract_json_object(outside)
        .and_then(|json| match serde_json::from_str::<TurnPayload>(&json) {
            Ok(payload) => Some(payload.tool_calls),
            Err(e) => {
                debug!(error = %e, "coder turn JSON is not a tool payload");
                None
            }
        })
        .unwrap_or_default();

    ExecutorTurn {
        tool_calls,
        final_answer: final_answer.filter(|s| !s.is_empty()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Terminal { command: String, output: CommandOutput },
    FilesWritten { files: BTreeMap<String, String> },
    FilesRead { files: BTreeMap<String, String> },
    Failed { tool: &'static str, error: String },
}

impl ToolResult {
    /// Text fed back to the coder on its next turn.
    pub fn render(&self) -> String {
        match self {
            ToolResult::Terminal { command, output } => format!(
                "$ {}\nexit code: {}\nstdout:\n{}\nstderr:\n{}",
                command,
                output.exit_code,
                truncate_chars(&output.stdout, MAX_OUTPUT_CHARS),
                truncate_chars(&output.stderr, MAX_OUTPUT_CHARS)
            ),
            ToolResult::FilesWritten { files } => format!(
                "wrote {} file(s): {}",
                files.len(),
                files.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
            ToolResult::FilesRead { files } => {
                let entries: Vec<_> = files
                    .iter()
                    .map(|(path, content)| json!({"path": path, "content": content}))
                    .collect();
                format!("readFiles result: {}", serde_json::Value::Array(entries))
            }
            ToolResult::Failed { tool, error } => format!("{} failed: {}", tool, error),
        }
    }
}

/// Mirror successful writes into the network state.
pub fn fold_results(state: &mut AgentNetworkState, results: &[ToolResult]) {
    for result in results {
        if let ToolResult::FilesWritten { files } = result {
            state
                .files
                .extend(files.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// Tool capabilities scoped to one sandbox of one run.
#[derive(Clone)]
pub struct ToolBox {
    ledger: ActionLedger,
    sandboxes: SandboxManager,
    ctx: ActionContext,
    sandbox_id: String,
}

impl ToolBox {
    pub fn new(
        ledger: ActionLedger,
        sandboxes: SandboxManager,
        ctx: ActionContext,
        sandbox_id: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            sandboxes,
            ctx,
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Run all calls of one turn concurrently. Results come back in call
    /// order once every call has finished.
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.execute(call))).await
    }

    /// Run one call. Sandbox failures become [`ToolResult::Failed`] so the
    /// coder can react to them; the ledger record is marked FAILED.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let project_id = self.ctx.project_id.as_str();
        let sandbox_id = self.sandbox_id.as_str();
        let outcome = match call {
            ToolCall::Terminal { command } => {
                let spec = ActionSpec::new(ActionKey::Terminal)
                    .detail(truncate_chars(command, 200))
                    .on_success(|out: &CommandOutput| {
                        ActionUpdate::detail(format!("exit {}", out.exit_code))
                            .with_metadata(json!({"exit_code": out.exit_code}))
                    });
                self.ledger
                    .run(&self.ctx, spec, async {
                        self.sandboxes
                            .run_command(project_id, sandbox_id, command)
                            .await
                            .map_err(anyhow::Error::from)
                    })
                    .await
                    .map(|output| ToolResult::Terminal {
                        command: command.clone(),
                        output,
                    })
            }
            ToolCall::CreateOrUpdateFiles { files } => {
                let map: BTreeMap<String, String> = files
                    .iter()
                    .map(|f| (f.path.clone(), f.content.clone()))
                    .collect();
                let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
                let spec = ActionSpec::new(ActionKey::WriteFiles)
                    .detail(truncate_chars(&paths.join(", "), 200))
                    .metadata(json!({"paths": paths}))
                    .on_success(|n: &usize| ActionUpdate::detail(format!("{} file(s) written", n)));
                self.ledger
                    .run(&self.ctx, spec, async {
                        self.sandboxes
                            .write_files(project_id, sandbox_id, &map)
                            .await
                            .map_err(anyhow::Error::from)
                    })
                    .await
                    .map(|_| ToolResult::FilesWritten { files: map.clone() })
            }
            ToolCall::ReadFiles { paths } => {
                let spec = ActionSpec::new(ActionKey::ReadFiles)
                    .detail(truncate_chars(&paths.join(", "), 200))
                    .on_success(|files: &BTreeMap<String, String>| {
                        ActionUpdate::detail(format!("{} file(s) read", files.len()))
                    });
                self.ledger
                    .run(&self.ctx, spec, async {
                        self.sandboxes
                            .read_files(project_id, sandbox_id, paths)
                            .await
                            .map_err(anyhow::Error::from)
                    })
                    .await
                    .map(|files| ToolResult::FilesRead { files })
            }
        };

        outcome.unwrap_or_else(|e| {
            warn!(project_id, sandbox_id, tool = call.name(), error = %e, "tool call failed");
            ToolResult::Failed {
                tool: call.name(),
                error: format!("{e:#}"),
            }
        })
    }
}
