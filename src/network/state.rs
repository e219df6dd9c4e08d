//! Agent network state and its pure stage transitions.
//!
//! ```text
//! planning ──plan parsed──▶ executing ──final answer──▶ review ──approved──▶ complete
//!                               ▲                          │
//!                               └────changes requested─────┘
//! ```
//!
//! A failed parse leaves the stage untouched; the caller decides whether to
//! retry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::plan::Plan;
use super::review::{Review, Verdict};
use crate::errors::NetworkError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Planning,
    Executing,
    Review,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Executing => "executing",
            Stage::Review => "review",
            Stage::Complete => "complete",
        }
    }

    /// The only edges the network may take.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::Planning, Stage::Executing)
                | (Stage::Executing, Stage::Review)
                | (Stage::Review, Stage::Complete)
                | (Stage::Review, Stage::Executing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChange {
    Added,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub change: FileChange,
    pub before: Option<String>,
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentNetworkState {
    pub summary: String,
    /// Files written during this run, keyed by path.
    pub files: BTreeMap<String, String>,
    /// Snapshot the run started from.
    pub baseline_files: BTreeMap<String, String>,
    pub stage: Stage,
    pub plan: Option<Plan>,
    pub review: Option<Review>,
    /// Reviewer notes still to be addressed.
    pub feedback: Vec<String>,
}

impl AgentNetworkState {
    pub fn new(baseline_files: BTreeMap<String, String>) -> Self {
        Self {
            baseline_files,
            ..Default::default()
        }
    }

    fn advance(&mut self, to: Stage) -> Result<(), NetworkError> {
        if !self.stage.can_advance_to(to) {
            return Err(NetworkError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }

    /// Files as the sandbox now holds them: baseline overlaid with this
    /// run's writes.
    pub fn merged_files(&self) -> BTreeMap<String, String> {
        let mut merged = self.baseline_files.clone();
        merged.extend(self.files.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Added and modified files relative to the baseline. Writes that left a
    /// file byte-identical are not diffs.
    pub fn diffs(&self) -> Vec<FileDiff> {
        self.files
            .iter()
            .filter_map(|(path, after)| match self.baseline_files.get(path) {
                None => Some(FileDiff {
                    path: path.clone(),
                    change: FileChange::Added,
                    before: None,
                    after: after.clone(),
                }),
                Some(before) if before != after => Some(FileDiff {
                    path: path.clone(),
                    change: FileChange::Modified,
                    before: Some(before.clone()),
                    after: after.clone(),
                }),
                Some(_) => None,
            })
            .collect()
    }
}

/// Planning → executing on a parsable plan. On a parse error the state is
/// left exactly as it was.
pub fn apply_plan_output(state: &mut AgentNetworkState, raw: &str) -> Result<(), NetworkError> {
    if state.stage != Stage::Planning {
        return Err(NetworkError::InvalidTransition {
            from: state.stage,
            to: Stage::Executing,
        });
    }
    let plan = Plan::parse(raw)?;
    state.advance(Stage::Executing)?;
    state.plan = Some(plan);
    Ok(())
}

/// Executing → review once the coder emits its final answer.
pub fn apply_final_answer(state: &mut AgentNetworkState, summary: &str) -> Result<(), NetworkError> {
    state.advance(Stage::Review)?;
    state.summary = summary.trim().to_string();
    Ok(())
}

/// Review → complete when approved; review → executing otherwise, with the
/// summary invalidated and the reviewer notes queued as feedback.
pub fn apply_review_output(state: &mut AgentNetworkState, raw: &str) -> Result<Verdict, NetworkError> {
    if state.stage != Stage::Review {
        return Err(NetworkError::InvalidTransition {
            from: state.stage,
            to: Stage::Complete,
        });
    }
    let review = Review::parse(raw)?;
    let verdict = review.verdict;
    match verdict {
        Verdict::Approved => {
            state.advance(Stage::Complete)?;
            state.feedback.clear();
        }
        Verdict::ChangesRequested => {
            state.advance(Stage::Executing)?;
            state.summary.clear();
            state.feedback = if review.notes.is_empty() {
                vec!["The reviewer requested changes without details; re-check the plan.".to_string()]
            } else {
                review.notes.clone()
            };
        }
    }
    state.review = Some(review);
    Ok(verdict)
}
