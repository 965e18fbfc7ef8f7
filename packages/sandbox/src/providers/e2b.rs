// ABOUTME: E2B provider for remote code execution sandboxes
// ABOUTME: Manages sandbox lifecycle over the E2B REST API and delegates work to envd

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::envd::EnvdClient;
use super::{
    ExecResult, OutputChunk, Provider, ProviderError, Result, SandboxConfig, SandboxInfo,
};

pub const DEFAULT_API_URL: &str = "https://api.e2b.app";
pub const DEFAULT_DOMAIN: &str = "e2b.app";

/// Port envd listens on inside every sandbox
const ENVD_PORT: u16 = 49983;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct TimeoutRequest {
    timeout: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "templateID", default)]
    template_id: String,
    started_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    envd_access_token: Option<String>,
}

/// E2B sandboxes reached through the public REST API
pub struct E2BProvider {
    http: Client,
    api_key: String,
    api_url: String,
    domain: String,
    envd_url_override: Option<String>,
    access_tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl E2BProvider {
    pub fn new(api_key: String, api_url: Option<String>, domain: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(ProviderError::ConfigError(
                "E2B API key is required".to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::ConfigError(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            api_url: api_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            domain: domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
            envd_url_override: None,
            access_tokens: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Route every envd call to a fixed base URL instead of the per-sandbox host
    pub fn with_envd_url(mut self, url: impl Into<String>) -> Self {
        self.envd_url_override = Some(url.into());
        self
    }

    async fn envd(&self, sandbox_id: &str) -> EnvdClient {
        let base_url = match &self.envd_url_override {
            Some(url) => url.clone(),
            None => format!("https://{}", self.host(sandbox_id, ENVD_PORT)),
        };
        let token = self.access_tokens.read().await.get(sandbox_id).cloned();
        EnvdClient::new(self.http.clone(), base_url, token)
    }

    async fn remember(&self, response: SandboxResponse) -> SandboxInfo {
        if let Some(token) = response.envd_access_token {
            self.access_tokens
                .write()
                .await
                .insert(response.sandbox_id.clone(), token);
        }
        SandboxInfo {
            id: response.sandbox_id,
            template: response.template_id,
            started_at: response.started_at,
            end_at: response.end_at,
        }
    }

    async fn check(&self, resp: Response, sandbox_id: Option<&str>) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(match (status, sandbox_id) {
            (StatusCode::NOT_FOUND, Some(id)) => ProviderError::NotFound(id.to_string()),
            (StatusCode::UNAUTHORIZED, _) | (StatusCode::FORBIDDEN, _) => {
                ProviderError::ConfigError(format!("E2B rejected the API key: {}", text))
            }
            _ => ProviderError::ApiError(format!("E2B returned {}: {}", status, text)),
        })
    }
}

#[async_trait]
impl Provider for E2BProvider {
    async fn create_sandbox(&self, config: &SandboxConfig) -> Result<SandboxInfo> {
        let body = CreateSandboxRequest {
            template_id: &config.template,
            timeout: config.timeout.as_secs(),
            metadata: &config.metadata,
        };

        let resp = self
            .http
            .post(format!("{}/sandboxes", self.api_url))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let resp = self.check(resp, None).await?;

        let sandbox: SandboxResponse = resp.json().await?;
        info!(
            "Created E2B sandbox {} from template {}",
            sandbox.sandbox_id, config.template
        );
        Ok(self.remember(sandbox).await)
    }

    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> Result<SandboxInfo> {
        let resp = self
            .http
            .post(format!("{}/sandboxes/{}/timeout", self.api_url, sandbox_id))
            .header("X-API-Key", &self.api_key)
            .json(&TimeoutRequest {
                timeout: timeout.as_secs(),
            })
            .send()
            .await?;
        self.check(resp, Some(sandbox_id)).await?;

        let resp = self
            .http
            .get(format!("{}/sandboxes/{}", self.api_url, sandbox_id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let resp = self.check(resp, Some(sandbox_id)).await?;

        let sandbox: SandboxResponse = resp.json().await?;
        debug!("Reconnected to E2B sandbox {}", sandbox_id);
        Ok(self.remember(sandbox).await)
    }

    async fn exec_command(
        &self,
        sandbox_id: &str,
        command: &str,
        output: UnboundedSender<OutputChunk>,
    ) -> Result<ExecResult> {
        self.envd(sandbox_id).await.run(command, output).await
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        self.envd(sandbox_id).await.write_file(path, content).await
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        self.envd(sandbox_id).await.read_file(path).await
    }

    fn host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{}-{}.{}", port, sandbox_id, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let result = E2BProvider::new(String::new(), None, None);
        assert!(matches!(result, Err(ProviderError::ConfigError(_))));
    }

    #[test]
    fn test_host_format() {
        let provider = E2BProvider::new("key".to_string(), None, None).unwrap();
        assert_eq!(provider.host("sbx1", 3000), "3000-sbx1.e2b.app");
    }
}
