use serde::{Deserialize, Serialize};

use crate::errors::NetworkError;
use crate::util::extract_json_object;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// One-line restatement of what the user asked for.
    #[serde(default)]
    pub goal: String,
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Plan {
    /// Parse planner output. The JSON object may be wrapped in prose or a
    /// code fence; a plan without tasks is rejected.
    pub fn parse(raw: &str) -> Result<Self, NetworkError> {
        let json = extract_json_object(raw).ok_or_else(|| NetworkError::PlanParse {
            message: "no JSON object in planner output".to_string(),
        })?;
        let plan: Plan = serde_json::from_str(&json).map_err(|e| NetworkError::PlanParse {
            message: e.to_string(),
        })?;
        if plan.tasks.is_empty() {
            return Err(NetworkError::PlanParse {
                message: "plan has no tasks".to_string(),
            });
        }
        Ok(plan)
    }

    /// Numbered task list for the coder and reviewer prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.goal.is_empty() {
            out.push_str(&format!("Goal: {}\n", self.goal));
        }
        for (i, task) in self.tasks.iter().enumerate() {
            out.push_str(&format!("{}. {}", i + 1, task.title));
            if !task.description.is_empty() {
                out.push_str(&format!(": {}", task.description));
            }
            if !task.files.is_empty() {
                out.push_str(&format!(" [{}]", task.files.join(", ")));
            }
            out.push('\n');
        }
        if !self.assumptions.is_empty() {
            out.push_str(&format!("Assumptions: {}\n", self.assumptions.join("; ")));
        }
        if !self.risks.is_empty() {
            out.push_str(&format!("Risks: {}\n", self.risks.join("; ")));
        }
        out
    }
}

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are the planner of a web app builder. The user describes a change to a Next.js app running in a sandbox. Produce a short implementation plan.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "goal": "One sentence restating the request",
  "tasks": [
    {
      "title": "Short task name",
      "description": "What to change and how",
      "files": ["app/page.tsx"]
    }
  ],
  "assumptions": ["Anything you assumed about unclear requirements"],
  "risks": ["Anything likely to break"]
}

Rules:
- Order tasks in the order they should be done.
- For simple requests, return a single task. Do not over-decompose.
- Only reference files under app/, components/, lib/ or public/.
"#;

pub fn build_plan_prompt(request: &str, context: &str, current_files: &[&str]) -> String {
    let files = if current_files.is_empty() {
        "(empty project)".to_string()
    } else {
        current_files.join("\n")
    };
    format!(
        "Plan the following change.\n\n\
         ## Request\n\
         {}\n\n\
         ## Conversation so far\n\
         {}\n\n\
         ## Current files\n\
         {}\n\n\
         Respond with JSON only.",
        request, context, files,
    )
}
