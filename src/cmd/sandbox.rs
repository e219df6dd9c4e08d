//! Sandbox inspection and control: `studio sandbox`.

use std::path::Path;

use anyhow::Result;
use console::style;
use forge_studio::config::StudioConfig;
use forge_studio::sandbox::SandboxRecord;
use forge_studio::store::DbHandle;
use forge_studio::util::format_ts;

use super::super::SandboxCommands;

fn print_record(rec: &SandboxRecord) {
    println!("{} {}", style("Sandbox").bold(), rec.sandbox_id);
    println!("  project:      {}", rec.project_id);
    println!("  status:       {}", rec.status);
    println!("  url:          {}", rec.url);
    println!("  generation:   {}", rec.generation);
    println!("  last active:  {}", format_ts(&rec.last_active_at));
    println!("  expires:      {}", format_ts(&rec.expires_at));
    if let Some(fragment) = &rec.last_synced_fragment_id {
        println!("  synced:       {}", fragment);
    }
}

pub async fn cmd_sandbox(project_dir: &Path, command: SandboxCommands) -> Result<()> {
    match command {
        SandboxCommands::Status { project } => {
            // Read-only: no provider credentials required.
            let config = StudioConfig::load(project_dir)?;
            let db = DbHandle::open(&config.server.db_path)?;
            let pid = project.clone();
            match db.call(move |db| db.get_sandbox(&pid)).await? {
                Some(rec) => print_record(&rec),
                None => println!("No sandbox tracked for project {}", project),
            }
        }
        SandboxCommands::Wake { project } => {
            let studio = super::open_studio(project_dir, None)?;
            let lease = studio.sandboxes().wake(&project).await?;
            let verb = if lease.was_recreated { "Created" } else { "Reconnected to" };
            println!("{} sandbox {}", verb, lease.sandbox_id);
            println!("  preview: {}", lease.url);
        }
        SandboxCommands::Kill { project } => {
            let studio = super::open_studio(project_dir, None)?;
            let rec = studio.sandboxes().kill(&project).await?;
            println!("{} sandbox {} is {}", style("✓").green(), rec.sandbox_id, rec.status);
        }
    }
    Ok(())
}
