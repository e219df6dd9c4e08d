//! Per-step action ledger.
//!
//! Every workflow step and every tool call is wrapped in [`ActionLedger::run`],
//! which persists a RUNNING record before the body executes and finalises it
//! afterwards. The UI polls [`ActionLedger::list`] (or listens on the event
//! channel) to render progress.

pub mod models;

use std::future::Future;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::events::{EventTx, StudioEvent, broadcast_message};
use crate::store::DbHandle;
use models::{ActionKey, ActionRecord, ActionStatus, ActionUpdate};

/// Which run a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub project_id: String,
    pub workflow_id: String,
}

impl ActionContext {
    pub fn new(project_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            workflow_id: workflow_id.into(),
        }
    }
}

type SuccessMapper<T> = Box<dyn FnOnce(&T) -> ActionUpdate + Send>;
type ErrorMapper = Box<dyn FnOnce(&anyhow::Error) -> String + Send>;

/// Describes one ledger entry and how to finalise it.
pub struct ActionSpec<T> {
    pub key: ActionKey,
    pub label: String,
    pub detail: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub on_success: Option<SuccessMapper<T>>,
    pub on_error: Option<ErrorMapper>,
}

impl<T> ActionSpec<T> {
    pub fn new(key: ActionKey) -> Self {
        Self {
            key,
            label: key.default_label().to_string(),
            detail: None,
            metadata: None,
            on_success: None,
            on_error: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) -> ActionUpdate + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&anyhow::Error) -> String + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

#[derive(Clone)]
pub struct ActionLedger {
    db: DbHandle,
    events: EventTx,
}

impl ActionLedger {
    pub fn new(db: DbHandle, events: EventTx) -> Self {
        Self { db, events }
    }

    /// Delete every record of a project. Idempotent.
    pub async fn reset(&self, project_id: &str) -> Result<usize> {
        let pid = project_id.to_string();
        let removed = self
            .db
            .call(move |db| db.delete_project_actions(&pid))
            .await
            .context("Failed to reset action ledger")?;
        broadcast_message(
            &self.events,
            &StudioEvent::ActionsCleared {
                project_id: project_id.to_string(),
            },
        );
        Ok(removed)
    }

    /// Delete records of every workflow except `workflow_id`, so a re-entered
    /// run keeps its own history.
    pub async fn reset_superseded(&self, project_id: &str, workflow_id: &str) -> Result<usize> {
        let (pid, wid) = (project_id.to_string(), workflow_id.to_string());
        self.db
            .call(move |db| db.delete_superseded_actions(&pid, &wid))
            .await
            .context("Failed to reset superseded actions")
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<ActionRecord>> {
        let pid = project_id.to_string();
        self.db.call(move |db| db.list_actions(&pid)).await
    }

    /// Wrap `body` in a ledger record.
    ///
    /// The RUNNING record is persisted before `body` is polled; if that write
    /// fails, `body` never runs. The body's own error is returned unchanged
    /// after the record is marked FAILED.
    pub async fn run<T, Fut>(&self, ctx: &ActionContext, spec: ActionSpec<T>, body: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        T: Send,
    {
        let ActionSpec {
            key,
            label,
            detail,
            metadata,
            on_success,
            on_error,
        } = spec;

        let record = self
            .start(ctx, key, label, detail, metadata)
            .await
            .with_context(|| format!("Failed to record {} start", key))?;

        match body.await {
            Ok(value) => {
                let update = on_success.map(|f| f(&value)).unwrap_or_default();
                self.finish(&record.id, ActionStatus::Completed, update, None)
                    .await
                    .with_context(|| format!("Failed to record {} completion", key))?;
                Ok(value)
            }
            Err(err) => {
                let message = match on_error {
                    Some(f) => f(&err),
                    None => format!("{err:#}"),
                };
                self.finish(&record.id, ActionStatus::Failed, ActionUpdate::default(), Some(message))
                    .await
                    .with_context(|| format!("Failed to record {} failure", key))?;
                Err(err)
            }
        }
    }

    /// Record a step that failed without running (e.g. cancellation).
    pub async fn record_failure(&self, ctx: &ActionContext, key: ActionKey, reason: &str) -> Result<()> {
        let record = self
            .start(ctx, key, key.default_label().to_string(), None, None)
            .await?;
        self.finish(
            &record.id,
            ActionStatus::Failed,
            ActionUpdate::default(),
            Some(reason.to_string()),
        )
        .await
    }

    /// Mark every RUNNING record of a workflow FAILED.
    pub async fn fail_running(&self, workflow_id: &str, reason: &str) -> Result<usize> {
        self.fail_open(workflow_id, reason, false).await
    }

    /// Mark the workflow's RUNNING tool-call records FAILED, e.g. after the
    /// step that made the calls was abandoned mid-flight.
    pub async fn fail_running_tools(&self, workflow_id: &str, reason: &str) -> Result<usize> {
        self.fail_open(workflow_id, reason, true).await
    }

    async fn fail_open(&self, workflow_id: &str, reason: &str, tools_only: bool) -> Result<usize> {
        let (wid, why) = (workflow_id.to_string(), reason.to_string());
        let failed = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let n = if tools_only {
                    db.fail_running_tool_actions(&wid, &why, &now)?
                } else {
                    db.fail_running_actions(&wid, &why, &now)?
                };
                Ok((n, db.list_workflow_actions(&wid)?))
            })
            .await
            .context("Failed to fail running actions")?;
        let (count, records) = failed;
        for action in records
            .into_iter()
            .filter(|a| a.status == ActionStatus::Failed && a.error.as_deref() == Some(reason))
        {
            broadcast_message(&self.events, &StudioEvent::ActionFinished { action });
        }
        if count > 0 {
            warn!(workflow_id, count, reason, "failed running actions");
        }
        Ok(count)
    }

    async fn start(
        &self,
        ctx: &ActionContext,
        key: ActionKey,
        label: String,
        detail: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ActionRecord> {
        let ctx = ctx.clone();
        let record = self
            .db
            .call(move |db| {
                let now = Utc::now();
                if key.is_step()
                    && let Some(existing) = db.find_step_action(&ctx.workflow_id, key)?
                {
                    let attempt = existing.attempt + 1;
                    db.restart_action(&existing.id, attempt, detail.as_deref(), &now)?;
                    return db
                        .get_action(&existing.id)?
                        .context("Restarted action vanished");
                }
                let record = ActionRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    project_id: ctx.project_id,
                    workflow_id: ctx.workflow_id,
                    key,
                    label,
                    detail,
                    metadata,
                    status: ActionStatus::Running,
                    attempt: 1,
                    started_at: now,
                    completed_at: None,
                    error: None,
                };
                db.insert_action(&record)?;
                Ok(record)
            })
            .await?;
        debug!(
            workflow_id = %record.workflow_id,
            key = %record.key,
            attempt = record.attempt,
            "action started"
        );
        broadcast_message(
            &self.events,
            &StudioEvent::ActionStarted {
                action: record.clone(),
            },
        );
        Ok(record)
    }

    async fn finish(
        &self,
        id: &str,
        status: ActionStatus,
        update: ActionUpdate,
        error: Option<String>,
    ) -> Result<()> {
        let id = id.to_string();
        let finished = self
            .db
            .call(move |db| {
                let now = Utc::now();
                if db.finish_action(&id, status, &update, error.as_deref(), &now)? {
                    db.get_action(&id)
                } else {
                    Ok(None)
                }
            })
            .await?;
        match finished {
            Some(action) => {
                broadcast_message(&self.events, &StudioEvent::ActionFinished { action });
            }
            // Deleted by a newer run's reset, or already failed by
            // cancellation. Nothing left to finalise.
            None => debug!(status = status.as_str(), "action already finalised"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    fn ledger() -> ActionLedger {
        ActionLedger::new(DbHandle::in_memory().unwrap(), event_channel())
    }

    fn ctx(workflow: &str) -> ActionContext {
        ActionContext::new("p1", workflow)
    }

    #[tokio::test]
    async fn test_run_records_completed_with_mapper() {
        let ledger = ledger();
        let spec = ActionSpec::new(ActionKey::GetSandbox)
            .detail("connecting")
            .on_success(|id: &String| ActionUpdate::detail(format!("sandbox {id}")));
        let value = ledger
            .run(&ctx("w1"), spec, async { Ok("sbx-1".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "sbx-1");

        let records = ledger.list("p1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ActionStatus::Completed);
        assert_eq!(records[0].detail.as_deref(), Some("sandbox sbx-1"));
        assert_eq!(records[0].label, "Starting sandbox");
        assert!(records[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_run_records_failure_and_returns_original_error() {
        let ledger = ledger();
        let spec: ActionSpec<()> = ActionSpec::new(ActionKey::Hydrate);
        let err = ledger
            .run(&ctx("w1"), spec, async { Err(anyhow::anyhow!("disk full")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");

        let records = ledger.list("p1").await.unwrap();
        assert_eq!(records[0].status, ActionStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_on_error_mapper_rewrites_message() {
        let ledger = ledger();
        let spec: ActionSpec<()> =
            ActionSpec::new(ActionKey::NetworkRun).on_error(|_| "agent crashed".to_string());
        let _ = ledger
            .run(&ctx("w1"), spec, async { Err(anyhow::anyhow!("raw")) })
            .await;
        let records = ledger.list("p1").await.unwrap();
        assert_eq!(records[0].error.as_deref(), Some("agent crashed"));
    }

    #[tokio::test]
    async fn test_step_retry_reuses_single_record() {
        let ledger = ledger();
        let c = ctx("w1");
        let _ = ledger
            .run(&c, ActionSpec::<()>::new(ActionKey::NetworkRun), async {
                Err(anyhow::anyhow!("first"))
            })
            .await;
        ledger
            .run(&c, ActionSpec::new(ActionKey::NetworkRun), async { Ok(()) })
            .await
            .unwrap();

        let records = ledger.list("p1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt, 2);
        assert_eq!(records[0].status, ActionStatus::Completed);
        assert!(records[0].error.is_none());
    }

    #[tokio::test]
    async fn test_tool_keys_create_one_record_per_call() {
        let ledger = ledger();
        let c = ctx("w1");
        for _ in 0..3 {
            ledger
                .run(&c, ActionSpec::new(ActionKey::Terminal), async { Ok(()) })
                .await
                .unwrap();
        }
        assert_eq!(ledger.list("p1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let ledger = ledger();
        ledger
            .run(&ctx("w1"), ActionSpec::new(ActionKey::Reset), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(ledger.reset("p1").await.unwrap(), 1);
        assert_eq!(ledger.reset("p1").await.unwrap(), 0);
        assert!(ledger.list("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_superseded_keeps_current_run() {
        let ledger = ledger();
        ledger
            .run(&ctx("old"), ActionSpec::new(ActionKey::Reset), async { Ok(()) })
            .await
            .unwrap();
        ledger
            .run(&ctx("new"), ActionSpec::new(ActionKey::Reset), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(ledger.reset_superseded("p1", "new").await.unwrap(), 1);
        let records = ledger.list("p1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].workflow_id, "new");
    }

    #[tokio::test]
    async fn test_ledger_write_failure_skips_body() {
        let db = DbHandle::in_memory().unwrap();
        let ledger = ActionLedger::new(db.clone(), event_channel());
        db.lock_sync().unwrap().drop_actions_table_for_test().unwrap();

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let result = ledger
            .run(&ctx("w1"), ActionSpec::new(ActionKey::Reset), async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fail_running_and_record_failure() {
        let ledger = ledger();
        let c = ctx("w1");
        let db = ledger.db.clone();
        // Leave a RUNNING record behind by starting without finishing.
        ledger
            .start(&c, ActionKey::NetworkRun, "Building".into(), None, None)
            .await
            .unwrap();
        assert_eq!(ledger.fail_running("w1", "cancelled").await.unwrap(), 1);
        ledger
            .record_failure(&c, ActionKey::GetUrl, "cancelled")
            .await
            .unwrap();

        let records = db.call(|db| db.list_workflow_actions("w1")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == ActionStatus::Failed));
        assert!(records.iter().all(|r| r.error.as_deref() == Some("cancelled")));
        assert!(records.iter().all(|r| r.status.is_terminal()));
    }

    #[tokio::test]
    async fn test_fail_running_tools_leaves_step_open() {
        let ledger = ledger();
        let c = ctx("w1");
        ledger
            .start(&c, ActionKey::NetworkRun, "Building".into(), None, None)
            .await
            .unwrap();
        ledger
            .start(&c, ActionKey::Terminal, "Running command".into(), None, None)
            .await
            .unwrap();

        assert_eq!(ledger.fail_running_tools("w1", "step timed out").await.unwrap(), 1);
        let records = ledger.db.call(|db| db.list_workflow_actions("w1")).await.unwrap();
        let step = records.iter().find(|r| r.key == ActionKey::NetworkRun).unwrap();
        let tool = records.iter().find(|r| r.key == ActionKey::Terminal).unwrap();
        assert_eq!(step.status, ActionStatus::Running);
        assert_eq!(tool.status, ActionStatus::Failed);
        assert_eq!(tool.error.as_deref(), Some("step timed out"));
    }

    #[tokio::test]
    async fn test_events_broadcast_for_start_and_finish() {
        let events = event_channel();
        let mut rx = events.subscribe();
        let ledger = ActionLedger::new(DbHandle::in_memory().unwrap(), events);
        ledger
            .run(&ctx("w1"), ActionSpec::new(ActionKey::Reset), async { Ok(()) })
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().contains("ActionStarted"));
        assert!(rx.recv().await.unwrap().contains("ActionFinished"));
    }
}
