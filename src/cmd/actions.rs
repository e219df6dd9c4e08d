//! Action ledger view: `studio actions`.

use std::path::Path;

use anyhow::Result;
use console::style;
use forge_studio::config::StudioConfig;
use forge_studio::events::event_channel;
use forge_studio::ledger::ActionLedger;
use forge_studio::ledger::models::ActionStatus;
use forge_studio::store::DbHandle;

/// Reads the ledger straight from the database; no sandbox provider needed.
pub async fn cmd_actions(project_dir: &Path, project_id: &str, json: bool) -> Result<()> {
    let config = StudioConfig::load(project_dir)?;
    let db = DbHandle::open(&config.server.db_path)?;
    let records = ActionLedger::new(db, event_channel()).list(project_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No actions recorded for project {}", project_id);
        return Ok(());
    }

    for rec in &records {
        let marker = match rec.status {
            ActionStatus::Running => style("…").yellow(),
            ActionStatus::Completed => style("✓").green(),
            ActionStatus::Failed => style("✗").red(),
        };
        let attempt = if rec.attempt > 1 {
            format!(" (attempt {})", rec.attempt)
        } else {
            String::new()
        };
        println!("{} {:<14} {}{}", marker, rec.key.as_str(), rec.label, attempt);
        if let Some(detail) = &rec.detail {
            println!("    {}", style(detail).dim());
        }
        if let Some(error) = &rec.error {
            println!("    {}", style(error).red());
        }
    }
    Ok(())
}
