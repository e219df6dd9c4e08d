//! Background idle sweep.
//!
//! The sweep never holds a lock across the provider call. It pauses from a
//! snapshot and commits the PAUSED status only if `last_active_at` is still
//! the value it observed, so activity that lands mid-sweep always wins.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::{SandboxManager, SandboxResult};
use super::models::{SandboxRecord, SandboxStatus};
use crate::errors::ProviderError;

/// What happened to a single record during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseDecision {
    Paused,
    /// Activity or another writer changed the record after it was observed.
    Raced,
    NotIdle,
    /// The provider no longer knows the sandbox.
    Gone,
    Unreachable,
    Failed(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub paused: usize,
    pub raced: usize,
    pub expired: usize,
    pub unreachable: usize,
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, decision: &PauseDecision) {
        match decision {
            PauseDecision::Paused => self.paused += 1,
            PauseDecision::Raced => self.raced += 1,
            PauseDecision::NotIdle => {}
            PauseDecision::Gone => self.expired += 1,
            PauseDecision::Unreachable => self.unreachable += 1,
            PauseDecision::Failed(_) => self.failed += 1,
        }
    }
}

impl SandboxManager {
    fn is_idle(&self, rec: &SandboxRecord, now: DateTime<Utc>) -> bool {
        let idle = chrono::Duration::from_std(self.settings.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        now - rec.last_active_at > idle
    }

    /// Pause the sandbox described by `observed` if it is still idle.
    ///
    /// `observed` is the snapshot the caller based its decision on. The
    /// PAUSED write is conditional on that snapshot's `last_active_at`.
    pub async fn pause_if_idle(
        &self,
        observed: &SandboxRecord,
        now: DateTime<Utc>,
    ) -> SandboxResult<PauseDecision> {
        if !matches!(observed.status, SandboxStatus::Running | SandboxStatus::Starting) {
            return Ok(PauseDecision::NotIdle);
        }
        if !self.is_idle(observed, now) {
            return Ok(PauseDecision::NotIdle);
        }

        let current = self.status(&observed.project_id).await?;
        let unchanged = current.as_ref().is_some_and(|rec| {
            rec.sandbox_id == observed.sandbox_id
                && rec.status == observed.status
                && rec.last_active_at == observed.last_active_at
        });
        if !unchanged {
            debug!(project_id = %observed.project_id, "record changed before pause, skipping");
            return Ok(PauseDecision::Raced);
        }

        match self.provider.pause(&observed.sandbox_id).await {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                let applied = self
                    .mark(observed, SandboxStatus::Expired, now)
                    .await?;
                return Ok(if applied {
                    info!(project_id = %observed.project_id, sandbox_id = %observed.sandbox_id, "sandbox gone at provider, marked expired");
                    PauseDecision::Gone
                } else {
                    PauseDecision::Raced
                });
            }
            Err(e) if e.is_unreachable() => {
                warn!(project_id = %observed.project_id, sandbox_id = %observed.sandbox_id, error = %e, "provider unreachable during sweep");
                self.mark(observed, SandboxStatus::Unknown, now).await?;
                return Ok(PauseDecision::Unreachable);
            }
            Err(e) => {
                warn!(project_id = %observed.project_id, sandbox_id = %observed.sandbox_id, error = %e, "pause failed");
                return Ok(PauseDecision::Failed(e.to_string()));
            }
        }

        let (pid, sid, seen) = (
            observed.project_id.clone(),
            observed.sandbox_id.clone(),
            observed.last_active_at,
        );
        let paused = self
            .db(move |db| db.pause_sandbox_if_idle(&pid, &sid, &seen, &now))
            .await?;
        if !paused {
            // Activity arrived while the provider call was in flight; the
            // record still says running, so the provider must too.
            debug!(project_id = %observed.project_id, "pause lost to concurrent activity, resuming");
            if let Err(e) = self
                .provider
                .connect(&observed.sandbox_id, self.settings.lifetime)
                .await
            {
                warn!(project_id = %observed.project_id, sandbox_id = %observed.sandbox_id, error = %e, "could not resume sandbox after lost pause");
            }
            return Ok(PauseDecision::Raced);
        }
        info!(project_id = %observed.project_id, sandbox_id = %observed.sandbox_id, "idle sandbox paused");
        self.publish(&observed.project_id).await;
        Ok(PauseDecision::Paused)
    }

    /// Conditional status change from the observed status. Records whose
    /// `last_active_at` moved past the snapshot are left alone.
    async fn mark(
        &self,
        observed: &SandboxRecord,
        to: SandboxStatus,
        now: DateTime<Utc>,
    ) -> SandboxResult<bool> {
        let (pid, sid, from) = (
            observed.project_id.clone(),
            observed.sandbox_id.clone(),
            observed.status,
        );
        let seen = observed.last_active_at;
        let applied = self
            .db(move |db| {
                let current = db.get_sandbox(&pid)?;
                if current.is_some_and(|rec| rec.last_active_at != seen) {
                    return Ok(false);
                }
                db.transition_sandbox(&pid, &sid, &[from], to, &now, None)
            })
            .await?;
        if applied {
            self.publish(&observed.project_id).await;
        }
        Ok(applied)
    }

    /// [`sweep`](Self::sweep) at the manager's clock.
    pub async fn sweep_now(&self) -> SandboxResult<SweepReport> {
        self.sweep(self.now()).await
    }

    /// One pass over every non-terminal record: expire the ones past their
    /// lifetime ceiling, pause the idle ones.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SandboxResult<SweepReport> {
        let candidates = self
            .db(|db| {
                db.list_sandboxes_in(&[
                    SandboxStatus::Starting,
                    SandboxStatus::Running,
                    SandboxStatus::Paused,
                    SandboxStatus::Unknown,
                ])
            })
            .await?;

        let mut report = SweepReport::default();
        for rec in candidates {
            report.examined += 1;
            if rec.expires_at <= now {
                if self.mark(&rec, SandboxStatus::Expired, now).await? {
                    info!(project_id = %rec.project_id, sandbox_id = %rec.sandbox_id, "sandbox lifetime elapsed, marked expired");
                    report.expired += 1;
                    if let Err(e) = self.provider.kill(&rec.sandbox_id).await {
                        debug!(sandbox_id = %rec.sandbox_id, error = %e, "kill of expired sandbox failed");
                    }
                } else {
                    report.raced += 1;
                }
                continue;
            }
            let decision = self.pause_if_idle(&rec, now).await?;
            report.record(&decision);
        }
        Ok(report)
    }
}

/// Runs [`SandboxManager::sweep`] on a fixed interval until cancelled.
pub struct IdleSweeper {
    manager: SandboxManager,
    interval: Duration,
}

impl IdleSweeper {
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "idle sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.manager.sweep_now().await {
                        Ok(report) if report.paused + report.expired + report.unreachable > 0 => {
                            info!(
                                paused = report.paused,
                                expired = report.expired,
                                raced = report.raced,
                                unreachable = report.unreachable,
                                "sweep finished"
                            );
                        }
                        Ok(report) => debug!(examined = report.examined, "sweep found nothing idle"),
                        Err(e) => warn!(error = %e, "sweep failed"),
                    }
                }
            }
        }
        info!("idle sweeper stopped");
    }
}
