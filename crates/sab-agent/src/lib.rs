//! HTTP adapter for the completion agent.
//!
//! One endpoint: POST `{AGENT_URL}/signal-bot` with `{"prompt": ...}`,
//! answered by `{"response": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sab_core::{completion::CompletionClient, config::Config, errors::Error, Result};

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    response: String,
}

/// Completion client for the agent service.
#[derive(Clone, Debug)]
pub struct AgentClient {
    endpoint: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            endpoint: completion_endpoint(base_url),
            http,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.agent_url, cfg.completion_timeout)
    }
}

#[async_trait]
impl CompletionClient for AgentClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&AgentRequest { prompt })
            .send()
            .await
            .map_err(map_request_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::CompletionHttp {
                status: status.as_u16(),
            });
        }

        let body: AgentResponse = resp
            .json()
            .await
            .map_err(|e| Error::CompletionDecode(e.to_string()))?;
        Ok(body.response)
    }
}

fn map_request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::CompletionTimeout;
    }
    Error::CompletionRequest(err.to_string())
}

/// Joins the configured base address with the bridge's endpoint path,
/// tolerating a single trailing slash on the base.
fn completion_endpoint(base_url: &str) -> String {
    let base = base_url.strip_suffix('/').unwrap_or(base_url);
    format!("{base}/signal-bot")
}
