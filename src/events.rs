//! Live progress events pushed to WebSocket subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ledger::models::ActionRecord;
use crate::sandbox::models::SandboxRecord;

/// Capacity of the broadcast channel. Slow subscribers that fall further
/// behind skip ahead (`RecvError::Lagged`).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type EventTx = broadcast::Sender<String>;

pub fn event_channel() -> EventTx {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StudioEvent {
    ActionStarted {
        action: ActionRecord,
    },
    ActionFinished {
        action: ActionRecord,
    },
    ActionsCleared {
        project_id: String,
    },
    SandboxUpdated {
        sandbox: SandboxRecord,
    },
    RunStarted {
        project_id: String,
        workflow_id: String,
    },
    RunCompleted {
        project_id: String,
        workflow_id: String,
        sandbox_url: String,
        fragment_id: Option<String>,
    },
    RunFailed {
        project_id: String,
        workflow_id: String,
        error: String,
    },
}

impl StudioEvent {
    /// The project the event belongs to.
    pub fn project_id(&self) -> &str {
        match self {
            StudioEvent::ActionStarted { action } | StudioEvent::ActionFinished { action } => &action.project_id,
            StudioEvent::SandboxUpdated { sandbox } => &sandbox.project_id,
            StudioEvent::ActionsCleared { project_id }
            | StudioEvent::RunStarted { project_id, .. }
            | StudioEvent::RunCompleted { project_id, .. }
            | StudioEvent::RunFailed { project_id, .. } => project_id,
        }
    }
}

/// Serialize and broadcast an event to all connected clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &EventTx, msg: &StudioEvent) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize studio event");
        }
    }
}
