//! Durable step execution.
//!
//! A step's output is checkpointed when it completes. Re-entering the same
//! workflow returns checkpointed outputs without running the step again, so
//! a restart between steps never repeats a side effect.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkflowSection;
use crate::errors::WorkflowError;
use crate::ledger::models::ActionKey;
use crate::ledger::{ActionContext, ActionLedger, ActionSpec};
use crate::store::{DbHandle, StepCheckpoint};

pub const CANCELLED_REASON: &str = "Workflow cancelled";

/// Error given to tool records left open by a step that timed out.
pub const TIMED_OUT_REASON: &str = "step timed out";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub step_timeout: Duration,
}

impl From<&WorkflowSection> for RetryPolicy {
    fn from(section: &WorkflowSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            initial_backoff: Duration::from_millis(section.backoff_initial_ms),
            max_backoff: Duration::from_millis(section.backoff_max_ms),
            step_timeout: Duration::from_secs(section.step_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WorkflowSection::default())
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `initial_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Progress of a step that has not completed yet, kept across attempts and
/// restarts. Stored next to the step's checkpoint under `<STEP>.partial`;
/// the completed checkpoint always wins over it.
#[derive(Clone)]
pub struct PartialCheckpoint {
    db: DbHandle,
    workflow_id: String,
    step: String,
}

impl PartialCheckpoint {
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, WorkflowError> {
        let (wid, step) = (self.workflow_id.clone(), self.step.clone());
        let stored = self
            .db
            .call(move |db| db.get_step_checkpoint(&wid, &step))
            .await?;
        match stored {
            // Unreadable progress is dropped; the step starts over.
            Some(cp) => match serde_json::from_value(cp.output) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(workflow_id = %self.workflow_id, step = %self.step, error = %e, "discarding unreadable partial checkpoint");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let cp = StepCheckpoint {
            workflow_id: self.workflow_id.clone(),
            step: self.step.clone(),
            output: serde_json::to_value(value)?,
            attempts: 0,
            completed_at: Utc::now(),
        };
        self.db.call(move |db| db.save_step_checkpoint(&cp)).await
    }
}

/// Runs the steps of one workflow run.
pub struct StepRunner {
    db: DbHandle,
    ledger: ActionLedger,
    ctx: ActionContext,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl StepRunner {
    pub fn new(
        db: DbHandle,
        ledger: ActionLedger,
        ctx: ActionContext,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            ledger,
            ctx,
            policy,
            cancel,
        }
    }

    pub fn context(&self) -> &ActionContext {
        &self.ctx
    }

    /// Where `key` keeps its in-flight progress.
    pub fn partial(&self, key: ActionKey) -> PartialCheckpoint {
        PartialCheckpoint {
            db: self.db.clone(),
            workflow_id: self.ctx.workflow_id.clone(),
            step: format!("{}.partial", key.as_str()),
        }
    }

    async fn checkpoint<T: DeserializeOwned>(&self, key: ActionKey) -> Result<Option<T>, WorkflowError> {
        let wid = self.ctx.workflow_id.clone();
        let stored = self
            .db
            .call(move |db| db.get_step_checkpoint(&wid, key.as_str()))
            .await?;
        match stored {
            Some(cp) => {
                let value = serde_json::from_value(cp.output).map_err(|e| {
                    WorkflowError::Other(anyhow::anyhow!("Corrupt checkpoint for {}: {}", key, e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn save_checkpoint<T: Serialize>(&self, key: ActionKey, value: &T, attempts: u32) -> Result<(), WorkflowError> {
        let output = serde_json::to_value(value)
            .map_err(|e| WorkflowError::Other(anyhow::anyhow!("Failed to serialize {} output: {}", key, e)))?;
        let cp = StepCheckpoint {
            workflow_id: self.ctx.workflow_id.clone(),
            step: key.as_str().to_string(),
            output,
            attempts,
            completed_at: Utc::now(),
        };
        self.db.call(move |db| db.save_step_checkpoint(&cp)).await?;
        Ok(())
    }

    /// Fail whatever is still RUNNING and record the step as failed without
    /// running it.
    async fn abort_cancelled(&self, key: ActionKey) -> WorkflowError {
        if let Err(e) = self
            .ledger
            .fail_running(&self.ctx.workflow_id, CANCELLED_REASON)
            .await
        {
            warn!(workflow_id = %self.ctx.workflow_id, error = %e, "could not fail running actions");
        }
        if let Err(e) = self
            .ledger
            .record_failure(&self.ctx, key, CANCELLED_REASON)
            .await
        {
            warn!(workflow_id = %self.ctx.workflow_id, step = %key, error = %e, "could not record cancelled step");
        }
        WorkflowError::Cancelled {
            step: key.as_str().to_string(),
        }
    }

    /// Run one step durably.
    ///
    /// `spec` builds the ledger entry for each attempt; `body` is invoked
    /// once per attempt.
    pub async fn run<T, S, F, Fut>(&self, key: ActionKey, spec: S, mut body: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        S: Fn() -> ActionSpec<T>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(done) = self.checkpoint::<T>(key).await? {
            debug!(workflow_id = %self.ctx.workflow_id, step = %key, "step already completed, using checkpoint");
            return Ok(done);
        }
        if self.cancel.is_cancelled() {
            info!(workflow_id = %self.ctx.workflow_id, step = %key, "workflow cancelled before step");
            return Err(self.abort_cancelled(key).await);
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let timeout = self.policy.step_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .ledger
                .run(&self.ctx, spec(), async {
                    match tokio::time::timeout(timeout, body()).await {
                        Ok(result) => result.map_err(anyhow::Error::new),
                        Err(_) => {
                            // The body was dropped mid-call; its tool records never finished.
                            if let Err(e) = self
                                .ledger
                                .fail_running_tools(&self.ctx.workflow_id, TIMED_OUT_REASON)
                                .await
                            {
                                warn!(workflow_id = %self.ctx.workflow_id, step = %key, error = %e, "could not close tool records");
                            }
                            Err(anyhow::Error::new(WorkflowError::StepTimeout {
                                step: key.as_str().to_string(),
                                secs: timeout.as_secs(),
                            }))
                        }
                    }
                })
                .await;

            let err = match outcome {
                Ok(value) => {
                    self.save_checkpoint(key, &value, attempt).await?;
                    return Ok(value);
                }
                Err(err) => match err.downcast::<WorkflowError>() {
                    Ok(typed) => typed,
                    Err(other) => WorkflowError::Other(other),
                },
            };

            if !err.is_retriable() {
                error!(workflow_id = %self.ctx.workflow_id, step = %key, error = %err, "step failed permanently");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(workflow_id = %self.ctx.workflow_id, step = %key, attempts = attempt, error = %err, "step out of attempts");
                return Err(WorkflowError::StepFailed {
                    step: key.as_str().to_string(),
                    attempts: attempt,
                    source: anyhow::Error::new(err),
                });
            }
            let delay = self.policy.backoff(attempt);
            warn!(
                workflow_id = %self.ctx.workflow_id,
                step = %key,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "step failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
