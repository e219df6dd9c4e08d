//! Wiring of the store, ledger, sandbox manager and orchestrator from a
//! loaded [`StudioConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{STUDIO_DIR, StudioConfig};
use crate::events::{EventTx, event_channel};
use crate::ledger::ActionLedger;
use crate::network::{AgentModel, ClaudeCliModel};
use crate::sandbox::{SandboxManager, SandboxSettings, build_provider};
use crate::store::DbHandle;
use crate::workflow::{Orchestrator, OrchestratorSettings};

#[derive(Clone)]
pub struct Studio {
    pub config: StudioConfig,
    pub project_dir: PathBuf,
    pub db: DbHandle,
    pub events: EventTx,
    pub orchestrator: Orchestrator,
}

impl Studio {
    /// Open the database and build every component. `model` defaults to the
    /// configured Claude CLI.
    pub fn open(project_dir: &Path, config: StudioConfig, model: Option<Arc<dyn AgentModel>>) -> Result<Self> {
        let studio_dir = project_dir.join(STUDIO_DIR);
        let db = DbHandle::open(&config.server.db_path).context("Failed to open studio database")?;
        let events = event_channel();

        let provider = build_provider(&config.sandbox, &studio_dir)?;
        let sandboxes = SandboxManager::new(
            db.clone(),
            provider,
            SandboxSettings::from(&config.sandbox),
            events.clone(),
        );
        let ledger = ActionLedger::new(db.clone(), events.clone());
        let model = model.unwrap_or_else(|| {
            Arc::new(ClaudeCliModel::new(config.agent.claude_cmd.clone()).with_working_dir(project_dir))
        });
        let orchestrator = Orchestrator::new(
            db.clone(),
            ledger,
            sandboxes,
            model,
            OrchestratorSettings::from(&config),
            events.clone(),
        );

        Ok(Self {
            config,
            project_dir: project_dir.to_path_buf(),
            db,
            events,
            orchestrator,
        })
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        self.orchestrator.sandboxes()
    }

    pub fn ledger(&self) -> &ActionLedger {
        self.orchestrator.ledger()
    }
}
