//! Reasoning provider boundary.

use crate::config::AnalysisConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// One completion call against the external reasoning service.
/// Retry policy lives in the analysis engine, not here.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn from_config(cfg: &AnalysisConfig) -> Self {
        let api_key = std::env::var(&cfg.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                env = %cfg.api_key_env,
                "No API key in environment; reasoning calls will likely be rejected"
            );
        }
        Self {
            client: reqwest::Client::new(),
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key,
        }
    }
}

#[async_trait]
impl ReasoningProvider for HttpProvider {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .context("Reasoning service request failed")?
            .error_for_status()
            .context("Reasoning service returned an error status")?;

        let payload: serde_json::Value = resp
            .json()
            .await
            .context("Reasoning service response was not JSON")?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .context("Reasoning service response missing message content")?;

        debug!(bytes = content.len(), "Reasoning service responded");
        Ok(content.to_string())
    }
}
