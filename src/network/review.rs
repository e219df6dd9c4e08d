//! Reviewer verdicts over the diff a run produced.

use serde::{Deserialize, Serialize};

use super::plan::Plan;
use super::state::{FileChange, FileDiff};
use crate::errors::NetworkError;
use crate::util::{extract_json_object, truncate_chars};

/// Longest file body quoted in a review prompt.
const MAX_QUOTED_CHARS: usize = 6000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    ChangesRequested,
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub verdict: Verdict,
    /// Concrete change requests; expected to be non-empty when changes are
    /// requested.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Review {
    pub fn parse(raw: &str) -> Result<Self, NetworkError> {
        let json = extract_json_object(raw).ok_or_else(|| NetworkError::ReviewParse {
            message: "no JSON object in reviewer output".to_string(),
        })?;
        serde_json::from_str(&json).map_err(|e| NetworkError::ReviewParse {
            message: e.to_string(),
        })
    }
}

pub const REVIEWER_SYSTEM_PROMPT: &str = r#"You review changes a coding agent made to a Next.js app against the plan it was given.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "verdict": "approved" | "changes_requested",
  "notes": ["Specific, actionable change request"]
}

Guidelines:
- approved: the plan is implemented and the code would build and render.
- changes_requested: a task is missing, the code would not compile, or an import is broken. Every note must say what to change and where.
- Do not request stylistic changes.
"#;

pub fn build_review_prompt(request: &str, plan: Option<&Plan>, summary: &str, diffs: &[FileDiff]) -> String {
    let plan_text = plan
        .map(Plan::render)
        .unwrap_or_else(|| "(no plan)".to_string());
    let mut diff_text = String::new();
    if diffs.is_empty() {
        diff_text.push_str("(no files changed)\n");
    }
    for diff in diffs {
        let tag = match diff.change {
            FileChange::Added => "added",
            FileChange::Modified => "modified",
        };
        diff_text.push_str(&format!(
            "### {} ({})\n```\n{}\n```\n",
            diff.path,
            tag,
            truncate_chars(&diff.after, MAX_QUOTED_CHARS)
        ));
    }
    format!(
        "## Request\n{}\n\n## Plan\n{}\n## Agent summary\n{}\n\n## Changed files\n{}\nRespond with JSON only.",
        request, plan_text, summary, diff_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_approved() {
        let review = Review::parse(r#"{"verdict": "approved"}"#).unwrap();
        assert!(review.verdict.is_approved());
        assert!(review.notes.is_empty());
    }

    #[test]
    fn test_parse_changes_requested_inside_prose() {
        let raw = r#"Looks close. {"verdict": "changes_requested", "notes": ["import Counter in app/page.tsx"]}"#;
        let review = Review::parse(raw).unwrap();
        assert_eq!(review.verdict, Verdict::ChangesRequested);
        assert_eq!(review.notes.len(), 1);
    }

    #[test]
    fn test_unknown_verdict_is_parse_error() {
        let err = Review::parse(r#"{"verdict": "maybe"}"#).unwrap_err();
        assert!(matches!(err, NetworkError::ReviewParse { .. }));
    }

    #[test]
    fn test_prompt_lists_diffs() {
        let diffs = vec![FileDiff {
            path: "app/page.tsx".into(),
            change: FileChange::Modified,
            before: Some("old".into()),
            after: "new".into(),
        }];
        let prompt = build_review_prompt("make it blue", None, "done", &diffs);
        assert!(prompt.contains("### app/page.tsx (modified)"));
        assert!(prompt.contains("(no plan)"));
    }
}
