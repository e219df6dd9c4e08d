//! One-shot workflow command: `studio run`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use forge_studio::network::{AgentModel, ReplayModel};
use forge_studio::workflow::WorkflowInput;

pub async fn cmd_run(
    project_dir: &Path,
    project_id: &str,
    message: &str,
    model: Option<String>,
    replay: Option<&Path>,
) -> Result<()> {
    if message.trim().is_empty() {
        anyhow::bail!("Message must not be empty");
    }
    let agent: Option<Arc<dyn AgentModel>> = match replay {
        Some(path) => Some(Arc::new(ReplayModel::from_file(path)?)),
        None => None,
    };
    let studio = super::open_studio(project_dir, agent)?;

    let (pid, content) = (project_id.to_string(), message.to_string());
    let stored = studio
        .db
        .call(move |db| db.create_user_message(&pid, &content))
        .await
        .context("Failed to store message")?;
    let workflow_id = uuid::Uuid::new_v4().to_string();
    let input = WorkflowInput {
        project_id: project_id.to_string(),
        company_id: None,
        model,
        value: message.to_string(),
        message_id: stored.id,
    };

    println!("{} {}", style("Workflow").bold(), workflow_id);
    let output = studio
        .orchestrator
        .start(&workflow_id, input)
        .await
        .with_context(|| format!("Workflow {} failed", workflow_id))?;

    match &output.fragment_id {
        Some(fragment_id) => {
            println!("{} {}", style("✓").green().bold(), output.summary);
            println!("  fragment: {}", fragment_id);
            println!("  preview:  {}", output.sandbox_url);
        }
        None => {
            println!(
                "{} The agent did not produce a usable result.",
                style("✗").red().bold()
            );
        }
    }
    Ok(())
}
