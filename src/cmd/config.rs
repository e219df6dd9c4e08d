//! Configuration view and validation commands: `studio config`.

use std::path::Path;

use anyhow::{Context, Result};
use forge_studio::config::StudioConfig;

use super::super::ConfigCommands;

fn secret_state(value: &Option<String>) -> &'static str {
    if value.is_some() { "set" } else { "not set" }
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = StudioConfig::path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Studio Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No studio.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let config = StudioConfig::load(project_dir)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("Effective values (with env overrides):");
            println!();
            println!("{}", rendered.trim_end());
            println!();
            println!("SANDBOX_API_KEY = {}", secret_state(&config.sandbox.api_key));
            println!(
                "SANDBOX_WEBHOOK_SECRET = {}",
                secret_state(&config.sandbox.webhook_secret)
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = StudioConfig::load(project_dir)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("studio.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            StudioConfig::default().save(&config_path)?;

            println!("Created studio.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [sandbox] provider, api_url, template, idle_timeout_secs");
            println!("  - [agent] model, claude_cmd, max_iterations");
            println!("  - [workflow] step_timeout_secs, max_attempts");
            println!();
            println!("Secrets are read from SANDBOX_API_KEY and SANDBOX_WEBHOOK_SECRET.");
            println!();
        }
    }

    Ok(())
}
