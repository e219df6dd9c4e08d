//! REST client for a remote sandbox provider.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::models::CommandOutput;
use super::provider::{ProviderResult, SandboxProvider, preview_host};
use crate::errors::ProviderError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time granted to the HTTP request over the command's own timeout.
const COMMAND_SLACK: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct CreateRequest<'a> {
    template: &'a str,
    timeout_ms: u64,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(Serialize)]
struct ConnectRequest {
    timeout_ms: u64,
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    cmd: &'a str,
    timeout_ms: u64,
}

pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    domain: String,
}

impl HttpSandboxProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        domain: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("forge-studio")
            .build()
            .context("Failed to build sandbox provider HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            domain: domain.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Send and classify the response: transport failures are
    /// `Unreachable`, 404 on a sandbox route is `NotFound`, any other
    /// non-success status is `Api`.
    async fn send(&self, req: RequestBuilder, sandbox_id: Option<&str>) -> ProviderResult<Response> {
        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND
            && let Some(id) = sandbox_id
        {
            return Err(ProviderError::NotFound {
                sandbox_id: id.to_string(),
            });
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        ProviderError::Unreachable(err.to_string())
    } else {
        ProviderError::Other(anyhow::Error::new(err).context("Sandbox provider request failed"))
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(
        &self,
        template: &str,
        lifetime: Duration,
        metadata: &BTreeMap<String, String>,
    ) -> ProviderResult<String> {
        let req = self.request(Method::POST, "/sandboxes").json(&CreateRequest {
            template,
            timeout_ms: millis(lifetime),
            metadata,
        });
        let resp = self.send(req, None).await?;
        let body: CreateResponse = resp
            .json()
            .await
            .context("Failed to parse create sandbox response")?;
        Ok(body.sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str, lifetime: Duration) -> ProviderResult<()> {
        let req = self
            .request(Method::POST, &format!("/sandboxes/{}/connect", sandbox_id))
            .json(&ConnectRequest {
                timeout_ms: millis(lifetime),
            });
        self.send(req, Some(sandbox_id)).await?;
        Ok(())
    }

    async fn pause(&self, sandbox_id: &str) -> ProviderResult<()> {
        let req = self.request(Method::POST, &format!("/sandboxes/{}/pause", sandbox_id));
        self.send(req, Some(sandbox_id)).await?;
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> ProviderResult<()> {
        let req = self.request(Method::DELETE, &format!("/sandboxes/{}", sandbox_id));
        match self.send(req, Some(sandbox_id)).await {
            // Already gone is as good as killed.
            Ok(_) | Err(ProviderError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> ProviderResult<()> {
        let req = self
            .request(Method::PUT, &format!("/sandboxes/{}/files", sandbox_id))
            .query(&[("path", path)])
            .body(content.to_string());
        self.send(req, Some(sandbox_id)).await?;
        Ok(())
    }

    /// A 404 here means the path is missing, not the sandbox; it surfaces
    /// as `Api { status: 404 }` like the local provider's.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> ProviderResult<String> {
        let req = self
            .request(Method::GET, &format!("/sandboxes/{}/files", sandbox_id))
            .query(&[("path", path)]);
        let resp = self.send(req, None).await?;
        Ok(resp
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", path))?)
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ProviderResult<CommandOutput> {
        let req = self
            .request(Method::POST, &format!("/sandboxes/{}/commands", sandbox_id))
            .timeout(timeout + COMMAND_SLACK)
            .json(&CommandRequest {
                cmd: command,
                timeout_ms: millis(timeout),
            });
        let resp = self.send(req, Some(sandbox_id)).await?;
        Ok(resp
            .json::<CommandOutput>()
            .await
            .context("Failed to parse command response")?)
    }

    fn host(&self, sandbox_id: &str, port: u16) -> String {
        preview_host(&self.domain, sandbox_id, port)
    }
}
