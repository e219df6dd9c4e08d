use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::models::{CommandOutput, SandboxLease, SandboxRecord, SandboxStatus};
use super::provider::{Clock, SandboxProvider, SystemClock};
use crate::config::SandboxSection;
use crate::errors::{ProviderError, SandboxError};
use crate::events::{EventTx, StudioEvent, broadcast_message};
use crate::store::{DbHandle, Fragment, StudioDb};

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// How many times `ensure` re-reads the record after losing a race before
/// giving up.
const MAX_RECONCILE_ROUNDS: usize = 4;

/// Lifecycle knobs, resolved from `[sandbox]` config.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub template: String,
    pub port: u16,
    pub lifetime: Duration,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
}

impl From<&SandboxSection> for SandboxSettings {
    fn from(section: &SandboxSection) -> Self {
        Self {
            template: section.template.clone(),
            port: section.port,
            lifetime: section.lifetime(),
            idle_timeout: section.idle_timeout(),
            command_timeout: section.command_timeout(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self::from(&SandboxSection::default())
    }
}

/// Owns the canonical "which sandbox backs project P" state.
///
/// Three actors write to a project's record concurrently: `ensure`/`wake`
/// callers, the webhook handler and the idle sweep. None of them holds a
/// lock across provider calls; every write is a conditional update keyed on
/// what the writer observed (`generation`, `sandbox_id`, `last_active_at`).
#[derive(Clone)]
pub struct SandboxManager {
    pub(super) db: DbHandle,
    pub(super) provider: Arc<dyn SandboxProvider>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: SandboxSettings,
    pub(super) events: EventTx,
}

impl SandboxManager {
    pub fn new(
        db: DbHandle,
        provider: Arc<dyn SandboxProvider>,
        settings: SandboxSettings,
        events: EventTx,
    ) -> Self {
        Self::with_clock(db, provider, settings, events, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: DbHandle,
        provider: Arc<dyn SandboxProvider>,
        settings: SandboxSettings,
        events: EventTx,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            provider,
            clock,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(super) fn expiry_from(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at + chrono::Duration::from_std(self.settings.lifetime)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800))
    }

    pub(super) async fn db<R, F>(&self, f: F) -> SandboxResult<R>
    where
        F: FnOnce(&StudioDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(SandboxError::Database)
    }

    pub async fn status(&self, project_id: &str) -> SandboxResult<Option<SandboxRecord>> {
        let pid = project_id.to_string();
        self.db(move |db| db.get_sandbox(&pid)).await
    }

    pub async fn list(&self) -> SandboxResult<Vec<SandboxRecord>> {
        self.db(|db| db.list_sandboxes()).await
    }

    /// Broadcast the current record so live clients see the change.
    pub(super) async fn publish(&self, project_id: &str) {
        match self.status(project_id).await {
            Ok(Some(sandbox)) => {
                broadcast_message(&self.events, &StudioEvent::SandboxUpdated { sandbox })
            }
            Ok(None) => {}
            Err(e) => debug!(project_id, error = %e, "could not publish sandbox update"),
        }
    }

    // ── On-demand path ────────────────────────────────────────────────

    /// Return a reachable sandbox for the project, reconnecting to the
    /// tracked one or creating a replacement.
    ///
    /// Reconnect failures of any kind lead to recreation; only a failed
    /// `create` is returned as an error.
    pub async fn ensure(
        &self,
        project_id: &str,
        latest_fragment_id: Option<&str>,
    ) -> SandboxResult<SandboxLease> {
        for round in 0..MAX_RECONCILE_ROUNDS {
            let current = self.status(project_id).await?;

            let observed_generation = match &current {
                Some(rec) if !rec.status.is_terminal() => {
                    match self
                        .provider
                        .connect(&rec.sandbox_id, self.settings.lifetime)
                        .await
                    {
                        Ok(()) => {
                            if let Some(lease) =
                                self.confirm_connected(rec, latest_fragment_id).await?
                            {
                                return Ok(lease);
                            }
                            debug!(project_id, round, "record changed during connect, retrying");
                            continue;
                        }
                        Err(e) => {
                            warn!(
                                project_id,
                                sandbox_id = %rec.sandbox_id,
                                error = %e,
                                "reconnect failed, recreating sandbox"
                            );
                            if !matches!(e, ProviderError::NotFound { .. }) {
                                self.discard(&rec.sandbox_id).await;
                            }
                            Some(rec.generation)
                        }
                    }
                }
                Some(rec) => Some(rec.generation),
                None => None,
            };

            if let Some(lease) = self
                .create_replacement(project_id, observed_generation)
                .await?
            {
                return Ok(lease);
            }
            debug!(project_id, round, "lost sandbox replacement race, reconnecting to winner");
        }
        Err(SandboxError::Contention {
            project_id: project_id.to_string(),
        })
    }

    /// `ensure` without a snapshot hint: hydration is only requested when
    /// the sandbox had to be recreated.
    pub async fn wake(&self, project_id: &str) -> SandboxResult<SandboxLease> {
        self.ensure(project_id, None).await
    }

    async fn confirm_connected(
        &self,
        rec: &SandboxRecord,
        latest_fragment_id: Option<&str>,
    ) -> SandboxResult<Option<SandboxLease>> {
        let now = self.now();
        let expires = self.expiry_from(now);
        let url = self.provider.host(&rec.sandbox_id, self.settings.port);
        let (pid, sid, u) = (rec.project_id.clone(), rec.sandbox_id.clone(), url.clone());
        let updated = self
            .db(move |db| db.mark_sandbox_connected(&pid, &sid, &u, &now, &expires))
            .await?;
        if !updated {
            return Ok(None);
        }
        if rec.status != SandboxStatus::Running {
            info!(project_id = %rec.project_id, sandbox_id = %rec.sandbox_id, from = %rec.status, "sandbox resumed");
        }
        self.publish(&rec.project_id).await;
        let needs_hydration = match latest_fragment_id {
            Some(latest) => rec.last_synced_fragment_id.as_deref() != Some(latest),
            None => false,
        };
        Ok(Some(SandboxLease {
            sandbox_id: rec.sandbox_id.clone(),
            url,
            needs_hydration,
            was_recreated: false,
        }))
    }

    /// Create a sandbox and install it if the record still has the observed
    /// generation. Returns `None` when another actor installed one first; the
    /// sandbox created here is then killed.
    async fn create_replacement(
        &self,
        project_id: &str,
        observed_generation: Option<i64>,
    ) -> SandboxResult<Option<SandboxLease>> {
        let mut metadata = BTreeMap::new();
        metadata.insert("projectId".to_string(), project_id.to_string());
        let sandbox_id = self
            .provider
            .create(&self.settings.template, self.settings.lifetime, &metadata)
            .await
            .map_err(|source| SandboxError::CreateFailed {
                project_id: project_id.to_string(),
                source,
            })?;

        let now = self.now();
        let url = self.provider.host(&sandbox_id, self.settings.port);
        let record = SandboxRecord {
            project_id: project_id.to_string(),
            sandbox_id: sandbox_id.clone(),
            url: url.clone(),
            status: SandboxStatus::Running,
            generation: observed_generation.unwrap_or(0) + 1,
            last_active_at: now,
            status_changed_at: now,
            expires_at: self.expiry_from(now),
            last_synced_fragment_id: None,
            created_at: now,
            updated_at: now,
        };
        let installed = self
            .db(move |db| db.install_sandbox(&record, observed_generation))
            .await?;

        if !installed {
            // A `created` webhook for this very sandbox may have installed it
            // first; in that case it is ours to keep.
            let current = self.status(project_id).await?;
            match current {
                Some(rec) if rec.sandbox_id == sandbox_id => {
                    return self.confirm_connected(&rec, None).await.map(|lease| {
                        lease.map(|l| SandboxLease {
                            needs_hydration: true,
                            was_recreated: true,
                            ..l
                        })
                    });
                }
                _ => {
                    self.discard(&sandbox_id).await;
                    return Ok(None);
                }
            }
        }

        info!(project_id, %sandbox_id, generation = observed_generation.unwrap_or(0) + 1, "sandbox created");
        self.publish(project_id).await;
        Ok(Some(SandboxLease {
            sandbox_id,
            url,
            needs_hydration: true,
            was_recreated: true,
        }))
    }

    /// Best-effort kill of a sandbox nobody tracks any more.
    async fn discard(&self, sandbox_id: &str) {
        if let Err(e) = self.provider.kill(sandbox_id).await {
            warn!(%sandbox_id, error = %e, "failed to kill orphaned sandbox");
        }
    }

    /// Record that `fragment_id` is now present in the sandbox. Ignored if
    /// the project has moved on to another sandbox.
    pub async fn mark_synced(
        &self,
        project_id: &str,
        sandbox_id: &str,
        fragment_id: Option<&str>,
    ) -> SandboxResult<bool> {
        let (pid, sid, fid) = (
            project_id.to_string(),
            sandbox_id.to_string(),
            fragment_id.map(str::to_string),
        );
        self.db(move |db| db.set_sandbox_synced(&pid, &sid, fid.as_deref()))
            .await
    }

    /// Write a fragment's files into the sandbox and record it as synced.
    pub async fn hydrate(
        &self,
        project_id: &str,
        sandbox_id: &str,
        fragment: &Fragment,
    ) -> SandboxResult<usize> {
        let written = self
            .write_files(project_id, sandbox_id, &fragment.files)
            .await?;
        self.mark_synced(project_id, sandbox_id, Some(&fragment.id))
            .await?;
        Ok(written)
    }

    /// Advance `last_active_at` (never backwards) and push out `expires_at`.
    pub async fn touch(&self, project_id: &str, sandbox_id: &str) -> SandboxResult<bool> {
        let now = self.now();
        let expires = self.expiry_from(now);
        let (pid, sid) = (project_id.to_string(), sandbox_id.to_string());
        self.db(move |db| db.touch_sandbox(&pid, &sid, &now, &expires))
            .await
    }

    // ── Provider pass-throughs ────────────────────────────────────────

    pub async fn write_files(
        &self,
        project_id: &str,
        sandbox_id: &str,
        files: &BTreeMap<String, String>,
    ) -> SandboxResult<usize> {
        for (path, content) in files {
            self.provider.write_file(sandbox_id, path, content).await?;
        }
        self.touch(project_id, sandbox_id).await?;
        Ok(files.len())
    }

    /// Read the given paths. Paths the sandbox reports as missing are left
    /// out of the result.
    pub async fn read_files(
        &self,
        project_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> SandboxResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for path in paths {
            match self.provider.read_file(sandbox_id, path).await {
                Ok(content) => {
                    out.insert(path.clone(), content);
                }
                Err(ProviderError::Api { status: 404, .. }) => {
                    debug!(%sandbox_id, %path, "file not present in sandbox");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.touch(project_id, sandbox_id).await?;
        Ok(out)
    }

    pub async fn run_command(
        &self,
        project_id: &str,
        sandbox_id: &str,
        command: &str,
    ) -> SandboxResult<CommandOutput> {
        let output = self
            .provider
            .run_command(sandbox_id, command, self.settings.command_timeout)
            .await?;
        self.touch(project_id, sandbox_id).await?;
        Ok(output)
    }

    pub fn preview_url(&self, sandbox_id: &str) -> String {
        self.provider.host(sandbox_id, self.settings.port)
    }

    /// Kill the project's sandbox at the provider and mark it Terminated.
    pub async fn kill(&self, project_id: &str) -> SandboxResult<SandboxRecord> {
        let rec = self
            .status(project_id)
            .await?
            .ok_or_else(|| SandboxError::NotTracked {
                project_id: project_id.to_string(),
            })?;
        if rec.status.is_terminal() {
            return Ok(rec);
        }
        self.provider.kill(&rec.sandbox_id).await?;
        let now = self.now();
        let (pid, sid) = (rec.project_id.clone(), rec.sandbox_id.clone());
        let record = self
            .db(move |db| {
                db.transition_sandbox(&pid, &sid, &[], SandboxStatus::Terminated, &now, None)?;
                db.get_sandbox(&pid)?
                    .context("Sandbox record disappeared after kill")
            })
            .await?;
        info!(project_id, sandbox_id = %rec.sandbox_id, "sandbox terminated");
        self.publish(project_id).await;
        Ok(record)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;

    #[tokio::test]
    async fn test_ensure_creates_then_reconnects() {
        let h = harness();
        let first = h.manager.ensure("p1", None).await.unwrap();
        assert!(first.was_recreated);
        assert!(first.needs_hydration);
        assert_eq!(first.url, format!("https://3000-{}.sandbox.local", first.sandbox_id));

        let second = h.manager.ensure("p1", None).await.unwrap();
        assert_eq!(second.sandbox_id, first.sandbox_id);
        assert!(!second.was_recreated);
        assert!(!second.needs_hydration);
        assert_eq!(h.provider.created_count(), 1);

        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(rec.status, SandboxStatus::Running);
        assert_eq!(rec.generation, 1);
    }

    #[tokio::test]
    async fn test_ensure_flags_hydration_for_unsynced_fragment() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        h.manager
            .mark_synced("p1", &lease.sandbox_id, Some("f1"))
            .await
            .unwrap();

        let same = h.manager.ensure("p1", Some("f1")).await.unwrap();
        assert!(!same.needs_hydration);
        let newer = h.manager.ensure("p1", Some("f2")).await.unwrap();
        assert!(newer.needs_hydration);
    }

    #[tokio::test]
    async fn test_expired_at_provider_is_recreated() {
        let h = harness();
        let first = h.manager.ensure("p1", Some("f1")).await.unwrap();
        h.manager.mark_synced("p1", &first.sandbox_id, Some("f1")).await.unwrap();
        h.provider.forget(&first.sandbox_id);

        let second = h.manager.ensure("p1", Some("f1")).await.unwrap();
        assert_ne!(second.sandbox_id, first.sandbox_id);
        assert!(second.was_recreated);
        assert!(second.needs_hydration);

        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(rec.generation, 2);
        assert!(rec.last_synced_fragment_id.is_none());
    }

    #[tokio::test]
    async fn test_create_failure_is_fatal() {
        let h = harness();
        h.provider.set_fail_create(true);
        let err = h.manager.ensure("p1", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::CreateFailed { .. }));
        assert!(h.manager.status("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_leaves_one_live_sandbox() {
        let h = harness();
        let calls = (0..6).map(|_| h.manager.ensure("p1", None));
        let leases = futures::future::join_all(calls).await;
        let ids: std::collections::HashSet<_> = leases
            .into_iter()
            .map(|l| l.unwrap().sandbox_id)
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.provider.live_count(), 1);
        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert!(ids.contains(&rec.sandbox_id));
    }

    #[tokio::test]
    async fn test_touch_is_monotonic_and_extends_expiry() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let before = h.manager.status("p1").await.unwrap().unwrap();

        h.clock.advance(chrono::Duration::seconds(60));
        assert!(h.manager.touch("p1", &lease.sandbox_id).await.unwrap());
        let after = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(after.last_active_at, before.last_active_at + chrono::Duration::seconds(60));
        assert_eq!(after.expires_at, after.last_active_at + chrono::Duration::seconds(1800));

        h.clock.advance(chrono::Duration::seconds(-30));
        assert!(!h.manager.touch("p1", &lease.sandbox_id).await.unwrap());
        let still = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(still.last_active_at, after.last_active_at);
    }

    #[tokio::test]
    async fn test_hydrate_roundtrip_matches_fragment() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let mut files = BTreeMap::new();
        files.insert("app/page.tsx".to_string(), "export default function Page() {}".to_string());
        files.insert("lib/util.ts".to_string(), "export const x = 1;".to_string());
        let fragment = Fragment {
            id: "f1".into(),
            project_id: "p1".into(),
            message_id: "m1".into(),
            sandbox_url: lease.url.clone(),
            title: "t".into(),
            summary: "s".into(),
            files: files.clone(),
            created_at: Utc::now(),
        };
        assert_eq!(h.manager.hydrate("p1", &lease.sandbox_id, &fragment).await.unwrap(), 2);

        let paths: Vec<String> = files.keys().cloned().collect();
        let read = h
            .manager
            .read_files("p1", &lease.sandbox_id, &paths)
            .await
            .unwrap();
        assert_eq!(read, files);
        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(rec.last_synced_fragment_id.as_deref(), Some("f1"));
    }

    #[tokio::test]
    async fn test_read_files_skips_missing_paths() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let read = h
            .manager
            .read_files("p1", &lease.sandbox_id, &["nope.txt".to_string()])
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_run_command_touches_record() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(10));
        let out = h
            .manager
            .run_command("p1", &lease.sandbox_id, "echo hi")
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(rec.last_active_at, h.clock.now());
    }

    #[tokio::test]
    async fn test_kill_marks_terminated_and_next_ensure_recreates() {
        let h = harness();
        let first = h.manager.ensure("p1", None).await.unwrap();
        let killed = h.manager.kill("p1").await.unwrap();
        assert_eq!(killed.status, SandboxStatus::Terminated);
        assert!(!h.provider.is_live(&first.sandbox_id));

        let second = h.manager.wake("p1").await.unwrap();
        assert_ne!(second.sandbox_id, first.sandbox_id);
        assert!(second.was_recreated);
    }

    #[tokio::test]
    async fn test_kill_untracked_project() {
        let h = harness();
        assert!(matches!(
            h.manager.kill("nobody").await.unwrap_err(),
            SandboxError::NotTracked { .. }
        ));
    }

    #[tokio::test]
    async fn test_wake_resumes_paused_sandbox() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        h.provider.pause(&lease.sandbox_id).await.unwrap();
        let now = h.clock.now();
        let sid = lease.sandbox_id.clone();
        h.db.call(move |db| {
            db.transition_sandbox("p1", &sid, &[], SandboxStatus::Paused, &now, None)
        })
        .await
        .unwrap();

        let woke = h.manager.wake("p1").await.unwrap();
        assert_eq!(woke.sandbox_id, lease.sandbox_id);
        assert!(!h.provider.is_paused(&lease.sandbox_id));
        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(rec.status, SandboxStatus::Running);
    }
}
