use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::context::{ContextBudget, ContextMessage, LoadedContext, append_summary, bound_payload};
use super::durable::{CANCELLED_REASON, PartialCheckpoint, RetryPolicy, StepRunner};
use crate::config::StudioConfig;
use crate::errors::{ProviderError, SandboxError, WorkflowError};
use crate::events::{EventTx, StudioEvent, broadcast_message};
use crate::ledger::models::{ActionKey, ActionUpdate};
use crate::ledger::{ActionContext, ActionLedger, ActionSpec};
use crate::network::{
    AgentModel, AgentNetwork, AgentNetworkState, NetworkInput, NetworkOutcome, NetworkProgress, ProgressStore, ToolBox,
};
use crate::sandbox::{SandboxLease, SandboxManager};
use crate::store::{DbHandle, MessageKind, NewFragment, RunStatus, WorkflowRun};
use crate::util::truncate_chars;

/// Assistant message shown when a run produced nothing usable.
pub const EMPTY_RESULT_MESSAGE: &str = "Something went wrong. Please try again.";

const TITLE_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub project_id: String,
    #[serde(default)]
    pub company_id: Option<String>,
    /// Overrides the configured agent model for this run.
    #[serde(default)]
    pub model: Option<String>,
    /// The user's request.
    pub value: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub summary: String,
    pub sandbox_url: String,
    pub fragment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub workflow_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HydrateOutcome {
    written: usize,
    fragment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResolvedUrl {
    sandbox_id: String,
    url: String,
    rewritten: usize,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub max_iterations: u32,
    pub context: ContextBudget,
    pub retry: RetryPolicy,
}

impl From<&StudioConfig> for OrchestratorSettings {
    fn from(config: &StudioConfig) -> Self {
        Self {
            model: config.agent.model.clone(),
            max_iterations: config.agent.max_iterations,
            context: ContextBudget::from(&config.context),
            retry: RetryPolicy::from(&config.workflow),
        }
    }
}

/// Sequences one agent run end to end:
/// RESET → LOAD_CONTEXT → GET_SANDBOX → HYDRATE → NETWORK_RUN → GET_URL → SAVE_RESULT.
#[derive(Clone)]
pub struct Orchestrator {
    db: DbHandle,
    ledger: ActionLedger,
    sandboxes: SandboxManager,
    model: Arc<dyn AgentModel>,
    settings: OrchestratorSettings,
    events: EventTx,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

fn sandbox_failure(err: SandboxError) -> WorkflowError {
    match err {
        SandboxError::CreateFailed {
            source: ProviderError::Api { status: 401 | 403, ref message },
            ..
        } => WorkflowError::Config(format!("Sandbox provider rejected credentials: {}", message)),
        other => WorkflowError::Other(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl ProgressStore for PartialCheckpoint {
    async fn save(&self, progress: &NetworkProgress) -> anyhow::Result<()> {
        PartialCheckpoint::save(self, progress).await
    }
}

fn title_from(summary: &str) -> String {
    let first = summary.lines().find(|l| !l.trim().is_empty()).unwrap_or("Untitled");
    truncate_chars(first.trim(), TITLE_CHARS)
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        ledger: ActionLedger,
        sandboxes: SandboxManager,
        model: Arc<dyn AgentModel>,
        settings: OrchestratorSettings,
        events: EventTx,
    ) -> Self {
        Self {
            db,
            ledger,
            sandboxes,
            model,
            settings,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ledger(&self) -> &ActionLedger {
        &self.ledger
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request cancellation. Takes effect before the run's next step.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        match self.registry().get(workflow_id) {
            Some(token) => {
                info!(workflow_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.registry().contains_key(workflow_id)
    }

    /// Store the user's message and start a run for it in the background.
    pub async fn submit(
        &self,
        project_id: &str,
        value: &str,
        model: Option<String>,
    ) -> anyhow::Result<Submission> {
        let (pid, content) = (project_id.to_string(), value.to_string());
        let message = self
            .db
            .call(move |db| db.create_user_message(&pid, &content))
            .await?;
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let input = WorkflowInput {
            project_id: project_id.to_string(),
            company_id: None,
            model,
            value: value.to_string(),
            message_id: message.id.clone(),
        };
        self.spawn(workflow_id.clone(), input);
        Ok(Submission {
            workflow_id,
            message_id: message.id,
        })
    }

    pub fn spawn(&self, workflow_id: String, input: WorkflowInput) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.start(&workflow_id, input).await {
                warn!(%workflow_id, error = %e, "workflow run ended with error");
            }
        });
    }

    /// Re-enter every run still marked running, e.g. after a restart.
    /// Completed steps are not executed again.
    pub async fn resume_incomplete(&self) -> anyhow::Result<Vec<String>> {
        let runs = self
            .db
            .call(|db| db.list_workflow_runs(RunStatus::Running))
            .await?;
        let mut resumed = Vec::new();
        for run in runs {
            if self.is_running(&run.workflow_id) {
                continue;
            }
            match serde_json::from_value::<WorkflowInput>(run.input.clone()) {
                Ok(input) => {
                    info!(workflow_id = %run.workflow_id, project_id = %run.project_id, "resuming workflow");
                    self.spawn(run.workflow_id.clone(), input);
                    resumed.push(run.workflow_id);
                }
                Err(e) => {
                    error!(workflow_id = %run.workflow_id, error = %e, "unreadable workflow input, marking failed");
                    let (wid, msg) = (run.workflow_id.clone(), format!("Unreadable input: {e}"));
                    self.db
                        .call(move |db| db.finish_workflow_run(&wid, RunStatus::Failed, None, Some(&msg)))
                        .await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Run (or re-enter) a workflow and wait for it to finish.
    pub async fn start(&self, workflow_id: &str, input: WorkflowInput) -> Result<WorkflowOutput, WorkflowError> {
        let cancel = {
            let mut registry = self.registry();
            registry
                .entry(workflow_id.to_string())
                .or_insert_with(CancellationToken::new)
                .clone()
        };
        let result = self.start_with_token(workflow_id, input, cancel).await;
        self.registry().remove(workflow_id);
        result
    }

    pub(crate) async fn start_with_token(
        &self,
        workflow_id: &str,
        input: WorkflowInput,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let run = WorkflowRun {
            workflow_id: workflow_id.to_string(),
            project_id: input.project_id.clone(),
            message_id: input.message_id.clone(),
            status: RunStatus::Running,
            input: serde_json::to_value(&input).context("Failed to encode workflow input")?,
            output: None,
            error: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
        };
        let created = self
            .db
            .call(move |db| {
                if db.create_workflow_run(&run)? {
                    return Ok(None);
                }
                db.get_workflow_run(&run.workflow_id)
            })
            .await?;
        if let Some(existing) = created {
            match (existing.status, existing.output) {
                (RunStatus::Running, _) => {
                    info!(workflow_id, "re-entering workflow");
                }
                (RunStatus::Completed, Some(output)) => {
                    return serde_json::from_value(output)
                        .context("Failed to decode stored workflow output")
                        .map_err(WorkflowError::from);
                }
                (status, _) => {
                    return Err(WorkflowError::Other(anyhow::anyhow!(
                        "Workflow {} already finished as {}",
                        workflow_id,
                        status.as_str()
                    )));
                }
            }
        }

        info!(workflow_id, project_id = %input.project_id, "workflow started");
        broadcast_message(
            &self.events,
            &StudioEvent::RunStarted {
                project_id: input.project_id.clone(),
                workflow_id: workflow_id.to_string(),
            },
        );

        let result = self.execute(workflow_id, &input, cancel).await;
        self.close_run(workflow_id, &input, &result).await;
        result
    }

    async fn close_run(&self, workflow_id: &str, input: &WorkflowInput, result: &Result<WorkflowOutput, WorkflowError>) {
        let (status, output, err_text) = match result {
            Ok(out) => (RunStatus::Completed, serde_json::to_value(out).ok(), None),
            Err(WorkflowError::Cancelled { .. }) => (RunStatus::Cancelled, None, Some(CANCELLED_REASON.to_string())),
            Err(e) => (RunStatus::Failed, None, Some(format!("{e:#}"))),
        };

        if status == RunStatus::Failed {
            let reason = err_text.clone().unwrap_or_default();
            if let Err(e) = self.ledger.fail_running(workflow_id, &reason).await {
                warn!(workflow_id, error = %e, "could not fail running actions");
            }
            // The user still gets exactly one assistant message for the run.
            let (pid, wid) = (input.project_id.clone(), workflow_id.to_string());
            if let Err(e) = self
                .db
                .call(move |db| db.save_workflow_result(&pid, &wid, MessageKind::Error, EMPTY_RESULT_MESSAGE, None))
                .await
            {
                warn!(workflow_id, error = %e, "could not store failure message");
            }
        }

        let (wid, err_for_db) = (workflow_id.to_string(), err_text.clone());
        if let Err(e) = self
            .db
            .call(move |db| db.finish_workflow_run(&wid, status, output.as_ref(), err_for_db.as_deref()))
            .await
        {
            warn!(workflow_id, error = %e, "could not close workflow run");
        }

        let event = match result {
            Ok(out) => {
                info!(workflow_id, fragment_id = ?out.fragment_id, "workflow completed");
                StudioEvent::RunCompleted {
                    project_id: input.project_id.clone(),
                    workflow_id: workflow_id.to_string(),
                    sandbox_url: out.sandbox_url.clone(),
                    fragment_id: out.fragment_id.clone(),
                }
            }
            Err(_) => {
                warn!(workflow_id, status = status.as_str(), error = ?err_text, "workflow did not complete");
                StudioEvent::RunFailed {
                    project_id: input.project_id.clone(),
                    workflow_id: workflow_id.to_string(),
                    error: err_text.unwrap_or_default(),
                }
            }
        };
        broadcast_message(&self.events, &event);
    }

    async fn execute(
        &self,
        workflow_id: &str,
        input: &WorkflowInput,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let ctx = ActionContext::new(input.project_id.clone(), workflow_id);
        let steps = StepRunner::new(
            self.db.clone(),
            self.ledger.clone(),
            ctx.clone(),
            self.settings.retry.clone(),
            cancel,
        );

        steps
            .run(
                ActionKey::Reset,
                || {
                    ActionSpec::new(ActionKey::Reset)
                        .on_success(|n: &usize| ActionUpdate::detail(format!("{} stale record(s) cleared", n)))
                },
                || self.reset(&ctx),
            )
            .await?;

        let loaded: LoadedContext = steps
            .run(
                ActionKey::LoadContext,
                || {
                    ActionSpec::new(ActionKey::LoadContext).on_success(|c: &LoadedContext| {
                        ActionUpdate::detail(format!(
                            "{} message(s), {} file(s)",
                            c.messages.len(),
                            c.files.len()
                        ))
                    })
                },
                || self.load_context(input),
            )
            .await?;

        let lease: SandboxLease = steps
            .run(
                ActionKey::GetSandbox,
                || {
                    ActionSpec::new(ActionKey::GetSandbox).on_success(|l: &SandboxLease| {
                        let detail = if l.was_recreated { "created" } else { "reconnected" };
                        ActionUpdate::detail(detail)
                            .with_metadata(json!({"sandbox_id": l.sandbox_id, "url": l.url}))
                    })
                },
                || self.get_sandbox(input, &loaded),
            )
            .await?;

        steps
            .run(
                ActionKey::Hydrate,
                || {
                    ActionSpec::new(ActionKey::Hydrate).on_success(|h: &HydrateOutcome| {
                        if h.written == 0 {
                            ActionUpdate::detail("up to date")
                        } else {
                            ActionUpdate::detail(format!("{} file(s) restored", h.written))
                        }
                    })
                },
                || self.hydrate(input, &lease, &loaded),
            )
            .await?;

        let progress = steps.partial(ActionKey::NetworkRun);
        let outcome: NetworkOutcome = steps
            .run(
                ActionKey::NetworkRun,
                || {
                    ActionSpec::new(ActionKey::NetworkRun).on_success(|o: &NetworkOutcome| {
                        let detail = if o.exhausted {
                            format!("stopped after {} iteration(s)", o.iterations)
                        } else {
                            format!("{} file(s) changed", o.files.len())
                        };
                        ActionUpdate::detail(detail).with_metadata(json!({
                            "stage": o.stage,
                            "iterations": o.iterations,
                            "exhausted": o.exhausted,
                        }))
                    })
                },
                || self.network_run(&ctx, &progress, input, &lease, &loaded),
            )
            .await?;

        let resolved: ResolvedUrl = steps
            .run(
                ActionKey::GetUrl,
                || ActionSpec::new(ActionKey::GetUrl).on_success(|r: &ResolvedUrl| ActionUpdate::detail(r.url.clone())),
                || self.resolve_url(input, &lease, &outcome),
            )
            .await?;

        steps
            .run(
                ActionKey::SaveResult,
                || {
                    ActionSpec::new(ActionKey::SaveResult).on_success(|o: &WorkflowOutput| match &o.fragment_id {
                        Some(id) => ActionUpdate::detail(format!("fragment {}", id)),
                        None => ActionUpdate::detail("no result"),
                    })
                },
                || self.save_result(workflow_id, input, &outcome, &resolved),
            )
            .await
    }

    // ── Steps ─────────────────────────────────────────────────────────

    async fn reset(&self, ctx: &ActionContext) -> Result<usize, WorkflowError> {
        Ok(self
            .ledger
            .reset_superseded(&ctx.project_id, &ctx.workflow_id)
            .await?)
    }

    async fn load_context(&self, input: &WorkflowInput) -> Result<LoadedContext, WorkflowError> {
        let pid = input.project_id.clone();
        let current = input.message_id.clone();
        // Fetch one extra so excluding the current message still fills the window.
        let limit = self.settings.context.max_messages + 1;
        let (messages, summary, fragment) = self
            .db
            .call(move |db| {
                let messages: Vec<ContextMessage> = db
                    .recent_messages(&pid, limit)?
                    .iter()
                    .filter(|m| m.id != current)
                    .map(ContextMessage::from)
                    .collect();
                Ok((messages, db.get_rolling_summary(&pid)?, db.latest_fragment(&pid)?))
            })
            .await?;
        let (messages, dropped) = bound_payload(messages, &self.settings.context);
        Ok(LoadedContext {
            messages,
            dropped,
            rolling_summary: summary,
            latest_fragment_id: fragment.as_ref().map(|f| f.id.clone()),
            files: fragment.map(|f| f.files).unwrap_or_default(),
        })
    }

    async fn get_sandbox(&self, input: &WorkflowInput, loaded: &LoadedContext) -> Result<SandboxLease, WorkflowError> {
        self.sandboxes
            .ensure(&input.project_id, loaded.latest_fragment_id.as_deref())
            .await
            .map_err(sandbox_failure)
    }

    async fn hydrate(
        &self,
        input: &WorkflowInput,
        lease: &SandboxLease,
        loaded: &LoadedContext,
    ) -> Result<HydrateOutcome, WorkflowError> {
        let pid = input.project_id.as_str();
        let written = if lease.needs_hydration && !loaded.files.is_empty() {
            self.sandboxes
                .write_files(pid, &lease.sandbox_id, &loaded.files)
                .await
                .map_err(sandbox_failure)?
        } else {
            0
        };
        if loaded.latest_fragment_id.is_some() {
            self.sandboxes
                .mark_synced(pid, &lease.sandbox_id, loaded.latest_fragment_id.as_deref())
                .await
                .map_err(sandbox_failure)?;
        }
        Ok(HydrateOutcome {
            written,
            fragment_id: loaded.latest_fragment_id.clone(),
        })
    }

    /// Runs the agent network, continuing from the progress an earlier
    /// attempt of this step saved, if any.
    async fn network_run(
        &self,
        ctx: &ActionContext,
        partial: &PartialCheckpoint,
        input: &WorkflowInput,
        lease: &SandboxLease,
        loaded: &LoadedContext,
    ) -> Result<NetworkOutcome, WorkflowError> {
        let model = input
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());
        let tools = ToolBox::new(
            self.ledger.clone(),
            self.sandboxes.clone(),
            ctx.clone(),
            lease.sandbox_id.clone(),
        );
        let network = AgentNetwork::new(self.model.clone(), tools, model.clone(), self.settings.max_iterations)
            .with_progress_store(Arc::new(partial.clone()));
        let progress = match partial.load::<NetworkProgress>().await? {
            Some(saved) => {
                info!(
                    workflow_id = %ctx.workflow_id,
                    stage = %saved.state.stage,
                    iterations = saved.iterations,
                    "resuming agent network"
                );
                saved
            }
            None => NetworkProgress::from(AgentNetworkState::new(loaded.files.clone())),
        };
        let network_input = NetworkInput {
            request: input.value.clone(),
            context: loaded.render(),
            model,
        };
        network
            .run(progress, &network_input)
            .await
            .map_err(|e| WorkflowError::Other(anyhow::Error::new(e)))
    }

    /// Wake the sandbox again; if it was replaced while the agent ran, put
    /// the agent's files back before handing out the URL.
    async fn resolve_url(
        &self,
        input: &WorkflowInput,
        lease: &SandboxLease,
        outcome: &NetworkOutcome,
    ) -> Result<ResolvedUrl, WorkflowError> {
        let pid = input.project_id.as_str();
        let current = self.sandboxes.wake(pid).await.map_err(sandbox_failure)?;
        let mut rewritten = 0;
        if current.sandbox_id != lease.sandbox_id && !outcome.snapshot.is_empty() {
            warn!(
                project_id = pid,
                old = %lease.sandbox_id,
                new = %current.sandbox_id,
                "sandbox replaced during run, restoring files"
            );
            rewritten = self
                .sandboxes
                .write_files(pid, &current.sandbox_id, &outcome.snapshot)
                .await
                .map_err(sandbox_failure)?;
        }
        let url = self.sandboxes.preview_url(&current.sandbox_id);
        Ok(ResolvedUrl {
            sandbox_id: current.sandbox_id,
            url,
            rewritten,
        })
    }

    async fn save_result(
        &self,
        workflow_id: &str,
        input: &WorkflowInput,
        outcome: &NetworkOutcome,
        resolved: &ResolvedUrl,
    ) -> Result<WorkflowOutput, WorkflowError> {
        let (pid, wid) = (input.project_id.clone(), workflow_id.to_string());
        let summary = outcome.summary.trim().to_string();

        if summary.is_empty() || outcome.files.is_empty() {
            warn!(
                workflow_id,
                summary_empty = summary.is_empty(),
                files = outcome.files.len(),
                "agent produced no usable result"
            );
            self.db
                .call(move |db| db.save_workflow_result(&pid, &wid, MessageKind::Error, EMPTY_RESULT_MESSAGE, None))
                .await?;
            return Ok(WorkflowOutput {
                summary,
                sandbox_url: resolved.url.clone(),
                fragment_id: None,
            });
        }

        let fragment = NewFragment {
            sandbox_url: resolved.url.clone(),
            title: title_from(&summary),
            summary: summary.clone(),
            files: snapshot_files(outcome),
        };
        let (request, content, budget) = (input.value.clone(), summary.clone(), self.settings.context.summary_budget);
        let saved = self
            .db
            .call(move |db| {
                let (_, fragment) = db.save_workflow_result(&pid, &wid, MessageKind::Result, &content, Some(&fragment))?;
                let mut entries = db.get_rolling_summary(&pid)?;
                append_summary(&mut entries, &request, &content, budget);
                db.set_rolling_summary(&pid, &entries)?;
                Ok(fragment)
            })
            .await?;
        let fragment_id = saved.map(|f| f.id);

        // The sandbox now holds exactly this fragment's files.
        if let Err(e) = self
            .sandboxes
            .mark_synced(&input.project_id, &resolved.sandbox_id, fragment_id.as_deref())
            .await
        {
            warn!(workflow_id, error = %e, "could not record synced fragment");
        }

        Ok(WorkflowOutput {
            summary,
            sandbox_url: resolved.url.clone(),
            fragment_id,
        })
    }
}

fn snapshot_files(outcome: &NetworkOutcome) -> BTreeMap<String, String> {
    if outcome.snapshot.is_empty() {
        outcome.files.clone()
    } else {
        outcome.snapshot.clone()
    }
}
