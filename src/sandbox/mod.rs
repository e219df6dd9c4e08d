//! Sandbox lifecycle: one tracked sandbox per project, reconciled between
//! on-demand `ensure` calls, provider webhooks and the idle sweep.

pub mod http;
pub mod local;
pub mod manager;
pub mod models;
pub mod provider;
pub mod sweep;
pub mod webhook;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};

pub use http::HttpSandboxProvider;
pub use local::LocalSandboxProvider;
pub use manager::{SandboxManager, SandboxResult, SandboxSettings};
pub use models::{CommandOutput, SandboxLease, SandboxRecord, SandboxStatus};
pub use provider::{Clock, SandboxProvider, SystemClock};
pub use sweep::{IdleSweeper, PauseDecision, SweepReport};
pub use webhook::{LifecycleEvent, LifecycleKind, ParsedWebhook, WebhookOutcome};

use crate::config::{ProviderKind, SandboxSection};

/// Build the configured provider. Local sandboxes live under
/// `{studio_dir}/sandboxes`.
///
/// A missing endpoint or API key for the http provider is a configuration
/// error and is never retried.
pub fn build_provider(section: &SandboxSection, studio_dir: &Path) -> Result<Arc<dyn SandboxProvider>> {
    match section.provider {
        ProviderKind::Local => Ok(Arc::new(LocalSandboxProvider::new(
            studio_dir.join("sandboxes"),
            section.domain.clone(),
        ))),
        ProviderKind::Http => {
            let Some(api_url) = section.api_url.as_deref() else {
                bail!("sandbox.api_url must be set for the http sandbox provider");
            };
            if section.api_key.is_none() {
                bail!("SANDBOX_API_KEY must be set for the http sandbox provider");
            }
            let provider =
                HttpSandboxProvider::new(api_url, section.api_key.clone(), section.domain.clone())?;
            Ok(Arc::new(provider))
        }
    }
}
