use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::{SandboxError, WebhookError};
use crate::events::EventTx;
use crate::sandbox::webhook::{SIGNATURE_HEADER, parse_webhook, verify_signature};
use crate::sandbox::ParsedWebhook;
use crate::store::DbHandle;
use crate::workflow::Orchestrator;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Orchestrator,
    pub events: EventTx,
    pub webhook_secret: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub value: String,
    #[serde(default)]
    pub model: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotTracked { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::MissingSignature | WebhookError::InvalidSignature => {
                ApiError::Unauthorized(err.to_string())
            }
            WebhookError::Malformed(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/projects/{id}/messages",
            get(list_messages).post(post_message),
        )
        .route(
            "/api/projects/{id}/actions",
            get(list_actions).delete(reset_actions),
        )
        .route(
            "/api/projects/{id}/sandbox",
            get(get_sandbox).delete(kill_sandbox),
        )
        .route("/api/projects/{id}/sandbox/wake", post(wake_sandbox))
        .route("/api/fragments/{id}", get(get_fragment))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/webhooks/sandbox", post(sandbox_webhook))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn post_message(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.value.trim().is_empty() {
        return Err(ApiError::BadRequest("Message must not be empty".into()));
    }
    let submission = state
        .orchestrator
        .submit(&project_id, &req.value, req.model)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

async fn list_messages(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .db
        .call(move |db| db.list_messages(&project_id))
        .await?;
    Ok(Json(messages))
}

async fn list_actions(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let actions = state.orchestrator.ledger().list(&project_id).await?;
    Ok(Json(actions))
}

async fn reset_actions(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cleared = state.orchestrator.ledger().reset(&project_id).await?;
    Ok(Json(json!({"cleared": cleared})))
}

async fn get_sandbox(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.sandboxes().status(&project_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound(format!(
            "No sandbox tracked for project {}",
            project_id
        ))),
    }
}

async fn kill_sandbox(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.sandboxes().kill(&project_id).await?;
    Ok(Json(record))
}

async fn wake_sandbox(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lease = state.orchestrator.sandboxes().wake(&project_id).await?;
    Ok(Json(lease))
}

async fn get_fragment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let fragment = state.db.call(move |db| db.get_fragment(&lookup)).await?;
    fragment
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Fragment {} not found", id)))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let run = state.db.call(move |db| db.get_workflow_run(&lookup)).await?;
    run.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let run = state.db.call(move |db| db.get_workflow_run(&lookup)).await?;
    let Some(run) = run else {
        return Err(ApiError::NotFound(format!("Run {} not found", id)));
    };
    if run.status.is_terminal() {
        return Err(ApiError::BadRequest(format!(
            "Run {} already {}",
            id,
            run.status.as_str()
        )));
    }
    let cancelled = state.orchestrator.cancel(&id);
    Ok(Json(json!({"cancelled": cancelled})))
}

async fn sandbox_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = verify_signature(state.webhook_secret.as_deref(), signature, &body) {
        warn!(error = %e, "rejected sandbox webhook");
        return Err(e.into());
    }
    let event = match parse_webhook(&body)? {
        ParsedWebhook::Event(event) => event,
        ParsedWebhook::Ignored { event_type } => {
            debug!(%event_type, "ignoring sandbox webhook");
            return Ok(Json(json!({"outcome": "ignored", "event_type": event_type})));
        }
    };
    let outcome = state.orchestrator.sandboxes().apply_webhook(&event).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(|e| ApiError::Internal(e.to_string()))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::ledger::ActionLedger;
    use crate::network::ReplayModel;
    use crate::sandbox::manager::test_support::{Harness, harness};
    use crate::sandbox::webhook::sign;
    use crate::workflow::{OrchestratorSettings, RetryPolicy};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(h: &Harness, secret: Option<&str>) -> SharedState {
        let events = event_channel();
        let settings = OrchestratorSettings {
            model: "test".into(),
            max_iterations: 3,
            context: crate::workflow::ContextBudget {
                max_messages: 20,
                payload_budget: 24_000,
                summary_budget: 8_000,
            },
            retry: RetryPolicy::default(),
        };
        let orchestrator = Orchestrator::new(
            h.db.clone(),
            ActionLedger::new(h.db.clone(), events.clone()),
            h.manager.clone(),
            Arc::new(ReplayModel::new()),
            settings,
            events.clone(),
        );
        Arc::new(AppState {
            db: h.db.clone(),
            orchestrator,
            events,
            webhook_secret: secret.map(str::to_string),
        })
    }

    fn app(h: &Harness, secret: Option<&str>) -> Router {
        api_router().with_state(state(h, secret))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn webhook_body(event_type: &str, sandbox_id: &str, project_id: &str) -> String {
        json!({
            "type": event_type,
            "sandbox_id": sandbox_id,
            "event_data": {"sandbox_metadata": {"projectId": project_id}},
            "timestamp": "2026-03-01T12:00:05Z",
        })
        .to_string()
    }

    fn post(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let resp = app(&h, None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_post_message_rejects_empty_value() {
        let h = harness();
        let resp = app(&h, None)
            .oneshot(post("/api/projects/p1/messages", json!({"value": "  "}).to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_message_accepts_and_stores() {
        let h = harness();
        let resp = app(&h, None)
            .oneshot(post("/api/projects/p1/messages", json!({"value": "make a todo app"}).to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        let message_id = body["message_id"].as_str().unwrap().to_string();
        assert!(body["workflow_id"].is_string());

        let stored = h.db.call(move |db| db.get_message(&message_id)).await.unwrap();
        assert_eq!(stored.unwrap().content, "make a todo app");
    }

    #[tokio::test]
    async fn test_unknown_sandbox_and_fragment_are_404() {
        let h = harness();
        let router = app(&h, None);
        for uri in ["/api/projects/p1/sandbox", "/api/fragments/nope", "/api/runs/nope"] {
            let resp = router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        let resp = router
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/projects/p1/sandbox")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wake_then_status() {
        let h = harness();
        let router = app(&h, None);
        let resp = router
            .clone()
            .oneshot(post("/api/projects/p1/sandbox/wake", String::new()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let lease = body_json(resp).await;
        assert_eq!(lease["was_recreated"], true);

        let resp = router
            .oneshot(Request::builder().uri("/api/projects/p1/sandbox").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let record = body_json(resp).await;
        assert_eq!(record["status"], "RUNNING");
        assert_eq!(record["sandbox_id"], lease["sandbox_id"]);
    }

    #[tokio::test]
    async fn test_webhook_signature_required_when_secret_set() {
        let h = harness();
        let router = app(&h, Some("s3cret"));
        let body = webhook_body("sandbox.lifecycle.paused", "sbx-1", "p1");

        let resp = router.clone().oneshot(post("/api/webhooks/sandbox", body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let mut req = post("/api/webhooks/sandbox", body.clone());
        req.headers_mut()
            .insert(SIGNATURE_HEADER, "deadbeef".parse().unwrap());
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let mut req = post("/api/webhooks/sandbox", body.clone());
        req.headers_mut()
            .insert(SIGNATURE_HEADER, sign("s3cret", body.as_bytes()).parse().unwrap());
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_malformed_and_ignored() {
        let h = harness();
        let router = app(&h, None);
        let resp = router
            .clone()
            .oneshot(post("/api/webhooks/sandbox", "not json".into()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body = webhook_body("sandbox.billing.updated", "sbx-1", "p1");
        let resp = router.oneshot(post("/api/webhooks/sandbox", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["outcome"], "ignored");
    }

    #[tokio::test]
    async fn test_webhook_killed_applies_to_tracked_sandbox() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let body = webhook_body("sandbox.lifecycle.killed", &lease.sandbox_id, "p1");
        let resp = app(&h, None)
            .oneshot(post("/api/webhooks/sandbox", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["outcome"], "applied");
        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert!(rec.status.is_terminal());
    }

    #[tokio::test]
    async fn test_actions_reset() {
        let h = harness();
        let router = app(&h, None);
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/projects/p1/actions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["cleared"], 0);

        let resp = router
            .oneshot(Request::builder().uri("/api/projects/p1/actions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, json!([]));
    }
}
