use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::model::{AgentModel, AgentRole, ModelRequest};
use super::plan::{PLANNER_SYSTEM_PROMPT, build_plan_prompt};
use super::review::{REVIEWER_SYSTEM_PROMPT, Verdict, build_review_prompt};
use super::state::{AgentNetworkState, Stage, apply_final_answer, apply_plan_output, apply_review_output};
use super::tools::{ToolBox, fold_results, parse_turn};
use crate::errors::NetworkError;
use crate::util::truncate_chars;

/// Transcript entries kept in the coder prompt; older ones are dropped.
const MAX_TRANSCRIPT_ENTRIES: usize = 12;

const MAX_ECHOED_RESPONSE_CHARS: usize = 4000;

pub const CODER_SYSTEM_PROMPT: &str = r#"You are a senior Next.js engineer working inside a sandbox. The dev server is already running; never start it yourself.

Each response may contain ONE JSON object with the tool calls to make, and nothing else that looks like JSON:
{"tool_calls": [
  {"tool": "terminal", "command": "npm install zod"},
  {"tool": "createOrUpdateFiles", "files": [{"path": "app/page.tsx", "content": "..."}]},
  {"tool": "readFiles", "paths": ["app/layout.tsx"]}
]}

Tool calls in one response run concurrently; do not make one depend on another from the same response. Results are returned on your next turn.

Write complete file contents, never partial snippets. Use relative paths.

When the task is fully done, reply with a short summary of what you built wrapped in:
<task_summary>
...
</task_summary>
"#;

/// What the caller asks the network to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInput {
    pub request: String,
    /// Rendered conversation context (prior summary and recent messages).
    pub context: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkOutcome {
    pub summary: String,
    /// Files written during the run.
    pub files: BTreeMap<String, String>,
    /// Baseline overlaid with `files`.
    pub snapshot: BTreeMap<String, String>,
    pub stage: Stage,
    /// The executing budget ran out before the reviewer approved.
    pub exhausted: bool,
    pub iterations: u32,
}

impl NetworkOutcome {
    fn from_progress(progress: NetworkProgress, exhausted: bool) -> Self {
        let NetworkProgress {
            state, iterations, ..
        } = progress;
        Self {
            snapshot: state.merged_files(),
            summary: state.summary,
            files: state.files,
            stage: state.stage,
            exhausted,
            iterations,
        }
    }
}

/// Where a run stands between stage transitions. Resuming from a saved
/// value continues at the same stage with the same plan, files and budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkProgress {
    pub state: AgentNetworkState,
    /// Executing turns spent so far.
    pub iterations: u32,
    #[serde(default)]
    pub transcript: Vec<String>,
}

impl From<AgentNetworkState> for NetworkProgress {
    fn from(state: AgentNetworkState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }
}

/// Persists [`NetworkProgress`] after every completed transition.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save(&self, progress: &NetworkProgress) -> anyhow::Result<()>;
}

/// Drives planning → executing → review for one run.
pub struct AgentNetwork {
    model: Arc<dyn AgentModel>,
    tools: ToolBox,
    model_name: String,
    max_iterations: u32,
    progress: Option<Arc<dyn ProgressStore>>,
}

impl AgentNetwork {
    pub fn new(
        model: Arc<dyn AgentModel>,
        tools: ToolBox,
        model_name: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            model,
            tools,
            model_name: model_name.into(),
            max_iterations,
            progress: None,
        }
    }

    pub fn with_progress_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(store);
        self
    }

    async fn save_progress(&self, progress: &mut NetworkProgress) -> Result<(), NetworkError> {
        let excess = progress.transcript.len().saturating_sub(MAX_TRANSCRIPT_ENTRIES);
        progress.transcript.drain(..excess);
        match &self.progress {
            Some(store) => store.save(progress).await.map_err(NetworkError::Progress),
            None => Ok(()),
        }
    }

    async fn call(&self, role: AgentRole, system: &str, prompt: String) -> Result<String, NetworkError> {
        let request = ModelRequest {
            role,
            model: self.model_name.clone(),
            system: system.to_string(),
            prompt,
        };
        self.model.complete(&request).await.map_err(NetworkError::Model)
    }

    /// One planning pass. On a parse error the state stays in planning.
    pub async fn plan_step(&self, state: &mut AgentNetworkState, input: &NetworkInput) -> Result<(), NetworkError> {
        let paths: Vec<&str> = state.baseline_files.keys().map(String::as_str).collect();
        let prompt = build_plan_prompt(&input.request, &input.context, &paths);
        let raw = self.call(AgentRole::Planner, PLANNER_SYSTEM_PROMPT, prompt).await?;
        if let Err(e) = apply_plan_output(state, &raw) {
            warn!(
                error = %e,
                raw = %truncate_chars(&raw, 500),
                "planner output rejected"
            );
            return Err(e);
        }
        info!(
            tasks = state.plan.as_ref().map_or(0, |p| p.tasks.len()),
            "plan accepted"
        );
        Ok(())
    }

    /// One coder turn. Returns true once the coder gave its final answer.
    pub async fn execute_turn(
        &self,
        state: &mut AgentNetworkState,
        input: &NetworkInput,
        transcript: &mut Vec<String>,
    ) -> Result<bool, NetworkError> {
        let prompt = build_coder_prompt(input, state, transcript);
        let raw = self.call(AgentRole::Coder, CODER_SYSTEM_PROMPT, prompt).await?;
        let turn = parse_turn(&raw);
        transcript.push(format!(
            "assistant:\n{}",
            truncate_chars(&raw, MAX_ECHOED_RESPONSE_CHARS)
        ));

        if !turn.tool_calls.is_empty() {
            debug!(calls = turn.tool_calls.len(), sandbox_id = self.tools.sandbox_id(), "executing tool calls");
            let results = self.tools.execute_all(&turn.tool_calls).await;
            fold_results(state, &results);
            let rendered: Vec<String> = results.iter().map(|r| r.render()).collect();
            transcript.push(format!("tool results:\n{}", rendered.join("\n\n")));
        }

        match turn.final_answer {
            Some(summary) => {
                apply_final_answer(state, &summary)?;
                Ok(true)
            }
            None => {
                if turn.tool_calls.is_empty() {
                    transcript.push(
                        "note: no tool calls and no <task_summary>; either act or finish.".to_string(),
                    );
                }
                Ok(false)
            }
        }
    }

    /// One review pass over the run's diff.
    pub async fn review_step(&self, state: &mut AgentNetworkState, input: &NetworkInput) -> Result<Verdict, NetworkError> {
        let prompt = build_review_prompt(&input.request, state.plan.as_ref(), &state.summary, &state.diffs());
        let raw = self.call(AgentRole::Reviewer, REVIEWER_SYSTEM_PROMPT, prompt).await?;
        let verdict = apply_review_output(state, &raw)?;
        match verdict {
            Verdict::Approved => info!("review approved"),
            Verdict::ChangesRequested => info!(notes = state.feedback.len(), "review requested changes"),
        }
        Ok(verdict)
    }

    /// Run from `progress` to completion or until `max_iterations`
    /// executing turns are spent in total.
    ///
    /// Budget exhaustion is not an error: the outcome carries whatever
    /// summary and files exist at that point. On error the last saved
    /// progress is where the next attempt resumes; a failed parse never
    /// moves the stage.
    pub async fn run(&self, mut progress: NetworkProgress, input: &NetworkInput) -> Result<NetworkOutcome, NetworkError> {
        loop {
            let state = &mut progress.state;
            match state.stage {
                Stage::Planning => self.plan_step(state, input).await?,
                Stage::Executing => {
                    if progress.iterations >= self.max_iterations {
                        warn!(
                            iterations = progress.iterations,
                            files = state.files.len(),
                            "agent iteration budget exhausted"
                        );
                        return Ok(NetworkOutcome::from_progress(progress, true));
                    }
                    progress.iterations += 1;
                    self.execute_turn(state, input, &mut progress.transcript).await?;
                }
                Stage::Review => {
                    if self.review_step(state, input).await? == Verdict::ChangesRequested {
                        progress
                            .transcript
                            .push(format!("reviewer requested changes:\n- {}", state.feedback.join("\n- ")));
                    }
                }
                Stage::Complete => {
                    info!(iterations = progress.iterations, files = state.files.len(), "agent network complete");
                    return Ok(NetworkOutcome::from_progress(progress, false));
                }
            }
            self.save_progress(&mut progress).await?;
        }
    }
}

fn build_coder_prompt(input: &NetworkInput, state: &AgentNetworkState, transcript: &[String]) -> String {
    let mut prompt = format!("## Request\n{}\n\n## Conversation so far\n{}\n\n", input.request, input.context);
    if let Some(plan) = &state.plan {
        prompt.push_str(&format!("## Plan\n{}\n", plan.render()));
    }
    if !state.feedback.is_empty() {
        prompt.push_str(&format!("## Reviewer feedback to address\n- {}\n\n", state.feedback.join("\n- ")));
    }
    let mut paths: Vec<&str> = state.baseline_files.keys().map(String::as_str).collect();
    paths.extend(
        state
            .files
            .keys()
            .filter(|p| !state.baseline_files.contains_key(*p))
            .map(String::as_str),
    );
    if !paths.is_empty() {
        prompt.push_str(&format!("## Files in the sandbox\n{}\n\n", paths.join("\n")));
    }
    let start = transcript.len().saturating_sub(MAX_TRANSCRIPT_ENTRIES);
    if start < transcript.len() {
        prompt.push_str("## Previous turns\n");
        for entry in &transcript[start..] {
            prompt.push_str(entry);
            prompt.push_str("\n\n");
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::ledger::{ActionContext, ActionLedger};
    use crate::network::model::ReplayModel;
    use crate::sandbox::manager::test_support::{Harness, harness};
    use async_trait::async_trait;

    const PLAN: &str = r#"{"goal": "counter", "tasks": [{"title": "Counter", "files": ["app/page.tsx"]}]}"#;
    const WRITE_AND_FINISH: &str = r#"{"tool_calls": [{"tool": "createOrUpdateFiles", "files": [{"path": "app/page.tsx", "content": "export default function Page() { return <button>0</button> }"}]}]}
<task_summary>Added a counter button.</task_summary>"#;

    fn input() -> NetworkInput {
        NetworkInput {
            request: "add a counter".into(),
            context: "(no prior messages)".into(),
            model: "test".into(),
        }
    }

    async fn network(h: &Harness, model: Arc<ReplayModel>, max_iterations: u32) -> AgentNetwork {
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let tools = ToolBox::new(
            ActionLedger::new(h.db.clone(), event_channel()),
            h.manager.clone(),
            ActionContext::new("p1", "wf-1"),
            lease.sandbox_id,
        );
        AgentNetwork::new(model, tools, "test", max_iterations)
    }

    #[tokio::test]
    async fn test_run_to_completion_with_one_revision() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        model
            .push(AgentRole::Planner, PLAN)
            .push(AgentRole::Coder, WRITE_AND_FINISH)
            .push(
                AgentRole::Reviewer,
                r#"{"verdict": "changes_requested", "notes": ["button needs onClick"]}"#,
            )
            .push(AgentRole::Coder, "<task_summary>Counter now increments.</task_summary>")
            .push(AgentRole::Reviewer, r#"{"verdict": "approved"}"#);
        let net = network(&h, model.clone(), 5).await;

        let outcome = net.run(AgentNetworkState::default().into(), &input()).await.unwrap();
        assert_eq!(outcome.stage, Stage::Complete);
        assert!(!outcome.exhausted);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.summary, "Counter now increments.");
        assert!(outcome.files.contains_key("app/page.tsx"));
        assert_eq!(model.remaining(AgentRole::Coder), 0);
    }

    #[tokio::test]
    async fn test_planner_retries_stay_in_planning() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        model
            .push(AgentRole::Planner, "I would start by...")
            .push(AgentRole::Planner, r#"{"tasks": 7}"#)
            .push(AgentRole::Planner, PLAN);
        let net = network(&h, model, 5).await;
        let mut state = AgentNetworkState::default();

        for _ in 0..2 {
            let err = net.plan_step(&mut state, &input()).await.unwrap_err();
            assert!(matches!(err, NetworkError::PlanParse { .. }));
            assert_eq!(state.stage, Stage::Planning);
        }
        net.plan_step(&mut state, &input()).await.unwrap();
        assert_eq!(state.stage, Stage::Executing);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_partial_result() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        model.push(AgentRole::Planner, PLAN);
        for _ in 0..3 {
            model.push(AgentRole::Coder, r#"{"tool_calls": [{"tool": "terminal", "command": "ls"}]}"#);
        }
        let net = network(&h, model, 3).await;

        let outcome = net.run(AgentNetworkState::default().into(), &input()).await.unwrap();
        assert!(outcome.exhausted);
        assert_eq!(outcome.stage, Stage::Executing);
        assert_eq!(outcome.summary, "");
        assert!(outcome.files.is_empty());
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        let net = network(&h, model, 3).await;
        let err = net.run(AgentNetworkState::default().into(), &input()).await.unwrap_err();
        assert!(matches!(err, NetworkError::Model(_)));
    }

    #[tokio::test]
    async fn test_written_files_land_in_sandbox() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        model
            .push(AgentRole::Planner, PLAN)
            .push(AgentRole::Coder, WRITE_AND_FINISH)
            .push(AgentRole::Reviewer, r#"{"verdict": "approved"}"#);
        let net = network(&h, model, 5).await;
        net.run(AgentNetworkState::default().into(), &input()).await.unwrap();

        let rec = h.manager.status("p1").await.unwrap().unwrap();
        let read = h
            .manager
            .read_files("p1", &rec.sandbox_id, &["app/page.tsx".to_string()])
            .await
            .unwrap();
        assert!(read["app/page.tsx"].contains("<button>"));
    }

    #[derive(Default)]
    struct MemoryProgress {
        saved: std::sync::Mutex<Vec<NetworkProgress>>,
    }

    impl MemoryProgress {
        fn last(&self) -> NetworkProgress {
            self.saved.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ProgressStore for MemoryProgress {
        async fn save(&self, progress: &NetworkProgress) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(progress.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bad_review_resumes_at_review_with_files() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        model
            .push(AgentRole::Planner, PLAN)
            .push(AgentRole::Coder, WRITE_AND_FINISH)
            .push(AgentRole::Reviewer, "not a verdict")
            .push(AgentRole::Reviewer, r#"{"verdict": "approved"}"#);
        let store = Arc::new(MemoryProgress::default());
        let net = network(&h, model.clone(), 5)
            .await
            .with_progress_store(store.clone());

        let err = net.run(AgentNetworkState::default().into(), &input()).await.unwrap_err();
        assert!(matches!(err, NetworkError::ReviewParse { .. }));
        let saved = store.last();
        assert_eq!(saved.state.stage, Stage::Review);
        assert_eq!(saved.iterations, 1);
        assert!(saved.state.files.contains_key("app/page.tsx"));

        // No planner or coder responses are left: the retry must start at review.
        let outcome = net.run(saved, &input()).await.unwrap();
        assert_eq!(outcome.stage, Stage::Complete);
        assert_eq!(outcome.summary, "Added a counter button.");
        assert!(outcome.files.contains_key("app/page.tsx"));
        assert_eq!(outcome.iterations, 1);
        assert_eq!(model.remaining(AgentRole::Reviewer), 0);
    }

    #[tokio::test]
    async fn test_budget_counts_turns_across_resumes() {
        let h = harness();
        let model = Arc::new(ReplayModel::new());
        model.push(AgentRole::Planner, PLAN);
        model.push(AgentRole::Coder, r#"{"tool_calls": [{"tool": "terminal", "command": "ls"}]}"#);
        let store = Arc::new(MemoryProgress::default());
        let net = network(&h, model.clone(), 2).await.with_progress_store(store.clone());

        // Second coder turn has no response and fails.
        assert!(net.run(AgentNetworkState::default().into(), &input()).await.is_err());
        let saved = store.last();
        assert_eq!(saved.iterations, 1);

        // One turn of budget is left, not two.
        model
            .push(AgentRole::Coder, r#"{"tool_calls": [{"tool": "terminal", "command": "ls"}]}"#)
            .push(AgentRole::Coder, r#"{"tool_calls": [{"tool": "terminal", "command": "ls"}]}"#);
        let outcome = net.run(saved, &input()).await.unwrap();
        assert!(outcome.exhausted);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(model.remaining(AgentRole::Coder), 1);
    }

    #[test]
    fn test_coder_prompt_keeps_recent_transcript() {
        let mut state = AgentNetworkState::default();
        state.feedback.push("fix import".into());
        let transcript: Vec<String> = (0..20).map(|i| format!("turn-{i}")).collect();
        let prompt = build_coder_prompt(&input(), &state, &transcript);
        assert!(prompt.contains("fix import"));
        assert!(prompt.contains("turn-19"));
        assert!(!prompt.contains("turn-7\n"));
    }
}
