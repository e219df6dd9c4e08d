//! CLI command implementations.
//!
//! | Module     | Commands handled       |
//! |------------|------------------------|
//! | `serve`    | `Serve`                |
//! | `run`      | `Run`                  |
//! | `sweep`    | `Sweep`                |
//! | `actions`  | `Actions`              |
//! | `sandbox`  | `Sandbox`              |
//! | `config`   | `Config`               |

pub mod actions;
pub mod config;
pub mod run;
pub mod sandbox;
pub mod serve;
pub mod sweep;

pub use actions::cmd_actions;
pub use config::cmd_config;
pub use run::cmd_run;
pub use sandbox::cmd_sandbox;
pub use serve::cmd_serve;
pub use sweep::cmd_sweep;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use forge_studio::config::StudioConfig;
use forge_studio::network::AgentModel;
use forge_studio::studio::Studio;

/// Load configuration for `project_dir` and wire up the studio.
pub(crate) fn open_studio(project_dir: &Path, model: Option<Arc<dyn AgentModel>>) -> Result<Studio> {
    let config = StudioConfig::load(project_dir)?;
    Studio::open(project_dir, config, model)
}
