//! HTTP surface: REST API, provider webhooks and the live event socket.

pub mod api;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::sandbox::IdleSweeper;
use crate::studio::Studio;
use api::{AppState, SharedState};

pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for a local frontend dev server.
    pub dev: bool,
    /// Run the idle sweep inside the server process.
    pub sweep: bool,
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn app_state(studio: &Studio) -> SharedState {
    Arc::new(AppState {
        db: studio.db.clone(),
        orchestrator: studio.orchestrator.clone(),
        events: studio.events.clone(),
        webhook_secret: studio.config.sandbox.webhook_secret.clone(),
    })
}

/// Serve until Ctrl+C. Interrupted workflow runs are resumed first.
pub async fn start_server(studio: Studio, options: ServerOptions) -> Result<()> {
    for warning in studio.config.validate() {
        warn!("{}", warning);
    }

    let resumed = studio.orchestrator.resume_incomplete().await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "resumed interrupted workflow runs");
    }

    let cancel = CancellationToken::new();
    let sweeper = options.sweep.then(|| {
        IdleSweeper::new(
            studio.sandboxes().clone(),
            Duration::from_secs(studio.config.sandbox.sweep_interval_secs),
        )
        .spawn(cancel.clone())
    });

    let mut app = build_router(app_state(&studio));
    if options.dev {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "studio server listening");
    println!("Forge Studio running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StudioConfig};
    use crate::network::ReplayModel;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_studio(dir: &std::path::Path) -> Studio {
        let mut config = StudioConfig::default();
        config.sandbox.provider = ProviderKind::Local;
        config.server.db_path = dir.join("studio.db");
        Studio::open(dir, config, Some(Arc::new(ReplayModel::new()))).unwrap()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(app_state(&test_studio(dir.path())));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(app_state(&test_studio(dir.path())));
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }
}
