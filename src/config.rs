//! Layered configuration for Forge Studio.
//!
//! Settings are read from `.studio/studio.toml`, then overridden by
//! environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".studio/studio.db"
//!
//! [sandbox]
//! provider = "http"            # or "local"
//! api_url = "https://api.sandboxes.example"
//! domain = "sandboxes.example"
//! template = "nextjs-app"
//! port = 3000
//! lifetime_secs = 1800
//! idle_timeout_secs = 300
//! sweep_interval_secs = 60
//! command_timeout_secs = 120
//!
//! [agent]
//! model = "claude-sonnet-4-5"
//! claude_cmd = "claude"
//! max_iterations = 15
//!
//! [workflow]
//! step_timeout_secs = 600
//! max_attempts = 3
//! backoff_initial_ms = 1000
//! backoff_max_ms = 30000
//!
//! [context]
//! max_messages = 20
//! payload_budget = 24000
//! summary_budget = 8000
//! ```
//!
//! Secrets (`SANDBOX_API_KEY`, `SANDBOX_WEBHOOK_SECRET`) are only ever read
//! from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STUDIO_DIR: &str = ".studio";
pub const CONFIG_FILE: &str = "studio.toml";

/// Which sandbox backend the manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote provider REST API.
    #[default]
    Http,
    /// In-process sandboxes, for development and tests.
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Http => write!(f, "http"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProviderKind::Http),
            "local" => Ok(ProviderKind::Local),
            _ => anyhow::bail!("Invalid sandbox provider '{}'. Valid values: http, local", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(STUDIO_DIR).join("studio.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Base URL of the provider REST API (http provider only)
    #[serde(default)]
    pub api_url: Option<String>,
    /// Domain used to build preview hosts: `{port}-{sandbox_id}.{domain}`
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_template")]
    pub template: String,
    /// Port the generated app listens on inside the sandbox
    #[serde(default = "default_app_port")]
    pub port: u16,
    /// Hard lifetime ceiling, refreshed on every activity touch
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Never serialized; comes from `SANDBOX_API_KEY`
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Never serialized; comes from `SANDBOX_WEBHOOK_SECRET`
    #[serde(skip)]
    pub webhook_secret: Option<String>,
}

fn default_domain() -> String {
    "sandbox.local".to_string()
}

fn default_template() -> String {
    "nextjs-app".to_string()
}

fn default_app_port() -> u16 {
    3000
}

fn default_lifetime_secs() -> u64 {
    30 * 60
}

fn default_idle_timeout_secs() -> u64 {
    5 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_command_timeout_secs() -> u64 {
    120
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            api_url: None,
            domain: default_domain(),
            template: default_template(),
            port: default_app_port(),
            lifetime_secs: default_lifetime_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            api_key: None,
            webhook_secret: None,
        }
    }
}

impl SandboxSection {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    /// Executing turns allowed per agent network run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_max_iterations() -> u32 {
    15
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            claude_cmd: default_claude_cmd(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Upper bound, in bytes of JSON, of the conversation payload
    #[serde(default = "default_payload_budget")]
    pub payload_budget: usize,
    /// Upper bound, in bytes of JSON, of the rolling summary
    #[serde(default = "default_summary_budget")]
    pub summary_budget: usize,
}

fn default_max_messages() -> usize {
    20
}

fn default_payload_budget() -> usize {
    24_000
}

fn default_summary_budget() -> usize {
    8_000
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            payload_budget: default_payload_budget(),
            summary_budget: default_summary_budget(),
        }
    }
}

/// The complete studio.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub context: ContextSection,
}

impl StudioConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse studio.toml")
    }

    /// Load `.studio/studio.toml` under `project_dir` (defaults if absent),
    /// then apply environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = Self::path(project_dir);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::parse(&content)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        if config.server.db_path.is_relative() {
            config.server.db_path = project_dir.join(&config.server.db_path);
        }
        Ok(config)
    }

    pub fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(STUDIO_DIR).join(CONFIG_FILE)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("STUDIO_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("STUDIO_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(provider) = lookup("SANDBOX_PROVIDER").and_then(|v| v.parse().ok()) {
            self.sandbox.provider = provider;
        }
        if let Some(url) = lookup("SANDBOX_API_URL") {
            self.sandbox.api_url = Some(url);
        }
        self.sandbox.api_key = lookup("SANDBOX_API_KEY").filter(|v| !v.is_empty());
        self.sandbox.webhook_secret = lookup("SANDBOX_WEBHOOK_SECRET").filter(|v| !v.is_empty());
        if let Some(model) = lookup("STUDIO_MODEL") {
            self.agent.model = model;
        }
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.agent.claude_cmd = cmd;
        }
    }

    /// Write the file-backed part of the configuration.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize studio.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.sandbox.provider == ProviderKind::Http {
            if self.sandbox.api_url.is_none() {
                warnings.push("sandbox.api_url is not set (required by the http provider)".into());
            }
            if self.sandbox.api_key.is_none() {
                warnings.push("SANDBOX_API_KEY is not set (required by the http provider)".into());
            }
        }
        if self.sandbox.webhook_secret.is_none() {
            warnings.push(
                "SANDBOX_WEBHOOK_SECRET is not set; webhook signatures will not be verified".into(),
            );
        }
        if self.sandbox.idle_timeout_secs >= self.sandbox.lifetime_secs {
            warnings.push(format!(
                "sandbox.idle_timeout_secs ({}) should be lower than sandbox.lifetime_secs ({})",
                self.sandbox.idle_timeout_secs, self.sandbox.lifetime_secs
            ));
        }
        if self.workflow.max_attempts == 0 {
            warnings.push("workflow.max_attempts is 0; steps will never run".into());
        }
        if self.agent.max_iterations == 0 {
            warnings.push("agent.max_iterations is 0; the agent will never execute".into());
        }
        warnings
    }
}
