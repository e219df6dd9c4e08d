use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Starting,
    Running,
    Paused,
    Killed,
    Expired,
    Terminated,
    /// Provider unreachable; resolved by the next successful reconciliation.
    Unknown,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Killed => "KILLED",
            Self::Expired => "EXPIRED",
            Self::Terminated => "TERMINATED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Terminal for the current `sandbox_id`: resuming work needs a new one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Killed | Self::Expired | Self::Terminated)
    }

    /// Counts toward the one-live-sandbox-per-project invariant.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }

    pub const TERMINAL: [SandboxStatus; 3] = [Self::Killed, Self::Expired, Self::Terminated];
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "KILLED" => Ok(Self::Killed),
            "EXPIRED" => Ok(Self::Expired),
            "TERMINATED" => Ok(Self::Terminated),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Invalid sandbox status: {}", s)),
        }
    }
}

/// Canonical state of the sandbox backing one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRecord {
    pub project_id: String,
    pub sandbox_id: String,
    pub url: String,
    pub status: SandboxStatus,
    /// Bumped every time a new `sandbox_id` is allocated for the project.
    pub generation: i64,
    pub last_active_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_synced_fragment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    /// The newest timestamp any writer has stamped on this record. Webhook
    /// events older than this are stale.
    pub fn freshness(&self) -> DateTime<Utc> {
        self.last_active_at.max(self.status_changed_at)
    }
}

/// What `ensure`/`wake` hand back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxLease {
    pub sandbox_id: String,
    pub url: String,
    /// Caller must write the latest snapshot before using the sandbox.
    pub needs_hydration: bool,
    pub was_recreated: bool,
}

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes_are_disjoint() {
        for status in [
            SandboxStatus::Starting,
            SandboxStatus::Running,
            SandboxStatus::Paused,
            SandboxStatus::Killed,
            SandboxStatus::Expired,
            SandboxStatus::Terminated,
            SandboxStatus::Unknown,
        ] {
            assert!(!(status.is_live() && status.is_terminal()));
            assert_eq!(status.as_str().parse::<SandboxStatus>().unwrap(), status);
        }
        assert!(!SandboxStatus::Unknown.is_live());
        assert!(!SandboxStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&SandboxStatus::Paused).unwrap(),
            "\"PAUSED\""
        );
    }

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput::default();
        assert!(ok.success());
        let failed = CommandOutput {
            exit_code: 2,
            ..Default::default()
        };
        assert!(!failed.success());
    }
}
