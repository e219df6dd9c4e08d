//! Plan/execute/review agent network.
//!
//! A planner turns the request into a [`plan::Plan`], a tool-using coder
//! implements it inside the run's sandbox, and a reviewer either approves
//! the diff or sends the coder back with notes. Stage changes only happen
//! through the pure transitions in [`state`].

pub mod model;
pub mod plan;
pub mod review;
pub mod runner;
pub mod state;
pub mod tools;

pub use model::{AgentModel, AgentRole, ClaudeCliModel, ModelRequest, ReplayModel};
pub use runner::{AgentNetwork, NetworkInput, NetworkOutcome, NetworkProgress, ProgressStore};
pub use state::{AgentNetworkState, FileChange, FileDiff, Stage};
pub use tools::ToolBox;
