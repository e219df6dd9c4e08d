//! HTTP server command: `studio serve`.

use std::path::Path;

use anyhow::Result;
use forge_studio::server::{ServerOptions, start_server};

pub async fn cmd_serve(
    project_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
    sweep: bool,
) -> Result<()> {
    let studio = super::open_studio(project_dir, None)?;
    let options = ServerOptions {
        host: host.unwrap_or_else(|| studio.config.server.host.clone()),
        port: port.unwrap_or(studio.config.server.port),
        dev,
        sweep,
    };
    start_server(studio, options).await
}
