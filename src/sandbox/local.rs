//! Sandbox provider backed by directories on the local machine.
//!
//! Each sandbox is a directory under `root`; commands run through `sh -c`
//! inside it. Intended for development and tests: there is no isolation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::models::CommandOutput;
use super::provider::{ProviderResult, SandboxProvider, preview_host};
use crate::errors::ProviderError;

/// Exit code reported when a command exceeds its timeout (matches `timeout(1)`).
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Default)]
struct LocalSandbox {
    paused: bool,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct LocalState {
    sandboxes: HashMap<String, LocalSandbox>,
    unreachable: bool,
    fail_create: bool,
    pause_delay: Option<Duration>,
    created: usize,
}

pub struct LocalSandboxProvider {
    root: PathBuf,
    domain: String,
    state: Mutex<LocalState>,
}

impl LocalSandboxProvider {
    pub fn new(root: impl Into<PathBuf>, domain: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            domain: domain.into(),
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Simulate a network partition: every call fails with `Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make `create` fail with an API error.
    pub fn set_fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Hold every `pause` call for `delay` before it takes effect.
    pub fn set_pause_delay(&self, delay: Duration) {
        self.lock().pause_delay = Some(delay);
    }

    /// Drop a sandbox as if its lifetime ceiling passed provider-side.
    pub fn forget(&self, sandbox_id: &str) {
        self.lock().sandboxes.remove(sandbox_id);
    }

    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    pub fn is_live(&self, sandbox_id: &str) -> bool {
        self.lock().sandboxes.contains_key(sandbox_id)
    }

    pub fn is_paused(&self, sandbox_id: &str) -> bool {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .is_some_and(|s| s.paused)
    }

    pub fn live_count(&self) -> usize {
        self.lock().sandboxes.len()
    }

    pub fn metadata(&self, sandbox_id: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.metadata.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        // A poisoned lock only means a test thread panicked mid-update; the
        // map itself is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> ProviderResult<()> {
        if self.lock().unreachable {
            return Err(ProviderError::Unreachable("local provider offline".into()));
        }
        Ok(())
    }

    fn check_live(&self, sandbox_id: &str) -> ProviderResult<()> {
        self.check_reachable()?;
        if !self.lock().sandboxes.contains_key(sandbox_id) {
            return Err(ProviderError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            });
        }
        Ok(())
    }

    /// Live and not paused: file and process calls need a running machine.
    fn check_running(&self, sandbox_id: &str) -> ProviderResult<()> {
        self.check_live(sandbox_id)?;
        if self.is_paused(sandbox_id) {
            return Err(ProviderError::Api {
                status: 409,
                message: format!("sandbox {} is paused", sandbox_id),
            });
        }
        Ok(())
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.root.join(sandbox_id)
    }

    fn resolve(&self, sandbox_id: &str, path: &str) -> ProviderResult<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ProviderError::Api {
                status: 400,
                message: format!("path escapes sandbox: {}", path),
            });
        }
        Ok(self.sandbox_dir(sandbox_id).join(rel))
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(
        &self,
        template: &str,
        _lifetime: Duration,
        metadata: &BTreeMap<String, String>,
    ) -> ProviderResult<String> {
        self.check_reachable()?;
        if self.lock().fail_create {
            return Err(ProviderError::Api {
                status: 503,
                message: "capacity exhausted".into(),
            });
        }
        let sandbox_id = format!("local-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        tokio::fs::create_dir_all(self.sandbox_dir(&sandbox_id))
            .await
            .context("Failed to create local sandbox directory")?;
        {
            let mut state = self.lock();
            state.created += 1;
            state.sandboxes.insert(
                sandbox_id.clone(),
                LocalSandbox {
                    paused: false,
                    metadata: metadata.clone(),
                },
            );
        }
        debug!(%sandbox_id, template, "local sandbox created");
        Ok(sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str, _lifetime: Duration) -> ProviderResult<()> {
        self.check_live(sandbox_id)?;
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.paused = false;
        }
        Ok(())
    }

    async fn pause(&self, sandbox_id: &str) -> ProviderResult<()> {
        self.check_live(sandbox_id)?;
        let delay = self.lock().pause_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.paused = true;
        }
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> ProviderResult<()> {
        self.check_reachable()?;
        self.lock().sandboxes.remove(sandbox_id);
        let dir = self.sandbox_dir(sandbox_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .context("Failed to remove local sandbox directory")?;
        }
        Ok(())
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> ProviderResult<()> {
        self.check_running(sandbox_id)?;
        let target = self.resolve(sandbox_id, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory for {}", path))?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> ProviderResult<String> {
        self.check_running(sandbox_id)?;
        let target = self.resolve(sandbox_id, path)?;
        match tokio::fs::read_to_string(&target).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProviderError::Api {
                status: 404,
                message: format!("file not found: {}", path),
            }),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to read {}", path))
                .into()),
        }
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ProviderResult<CommandOutput> {
        self.check_running(sandbox_id)?;
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.sandbox_dir(sandbox_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn sandbox command")?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("Failed to collect command output")?;
                Ok(CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => Ok(CommandOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
            }),
        }
    }

    fn host(&self, sandbox_id: &str, port: u16) -> String {
        preview_host(&self.domain, sandbox_id, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> (tempfile::TempDir, LocalSandboxProvider) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalSandboxProvider::new(dir.path(), "sandbox.local");
        (dir, provider)
    }

    #[tokio::test]
    async fn test_create_write_read_command() {
        let (_dir, p) = provider();
        let mut meta = BTreeMap::new();
        meta.insert("projectId".to_string(), "p1".to_string());
        let id = p.create("nextjs-app", Duration::from_secs(60), &meta).await.unwrap();
        assert_eq!(p.metadata(&id).unwrap()["projectId"], "p1");

        p.write_file(&id, "app/page.tsx", "hello").await.unwrap();
        assert_eq!(p.read_file(&id, "app/page.tsx").await.unwrap(), "hello");

        let out = p
            .run_command(&id, "cat app/page.tsx", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_command_timeout_reports_exit_124() {
        let (_dir, p) = provider();
        let id = p.create("t", Duration::from_secs(60), &BTreeMap::new()).await.unwrap();
        let out = p
            .run_command(&id, "sleep 5", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, p) = provider();
        let id = p.create("t", Duration::from_secs(60), &BTreeMap::new()).await.unwrap();
        let err = p.write_file(&id, "../escape.txt", "x").await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_forgotten_sandbox_is_not_found() {
        let (_dir, p) = provider();
        let id = p.create("t", Duration::from_secs(60), &BTreeMap::new()).await.unwrap();
        p.forget(&id);
        let err = p.connect(&id, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_toggle() {
        let (_dir, p) = provider();
        p.set_unreachable(true);
        let err = p
            .create("t", Duration::from_secs(60), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_pause_and_connect_toggle_paused() {
        let (_dir, p) = provider();
        let id = p.create("t", Duration::from_secs(60), &BTreeMap::new()).await.unwrap();
        p.pause(&id).await.unwrap();
        assert!(p.is_paused(&id));
        let err = p.run_command(&id, "true", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 409, .. }));
        p.connect(&id, Duration::from_secs(60)).await.unwrap();
        assert!(!p.is_paused(&id));
        p.kill(&id).await.unwrap();
        assert!(!p.is_live(&id));
        assert_eq!(p.live_count(), 0);
    }

    #[test]
    fn test_host() {
        let (_dir, p) = provider();
        assert_eq!(p.host("abc", 3000), "https://3000-abc.sandbox.local");
    }
}
