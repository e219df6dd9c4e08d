//! Idle sweep command: `studio sweep`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use forge_studio::sandbox::IdleSweeper;
use tokio_util::sync::CancellationToken;

pub async fn cmd_sweep(project_dir: &Path, once: bool) -> Result<()> {
    let studio = super::open_studio(project_dir, None)?;

    if once {
        let report = studio.sandboxes().sweep_now().await?;
        println!(
            "{} examined {}, paused {}, expired {}, raced {}, unreachable {}, failed {}",
            style("Sweep:").bold(),
            report.examined,
            report.paused,
            report.expired,
            report.raced,
            report.unreachable,
            report.failed
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interval = studio.config.sandbox.sweep_interval();
    let handle = IdleSweeper::new(studio.sandboxes().clone(), interval).spawn(cancel.clone());
    println!("Sweeping every {}s. Press Ctrl+C to stop.", interval.as_secs());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    cancel.cancel();
    handle.await.context("Sweeper task panicked")?;
    Ok(())
}
