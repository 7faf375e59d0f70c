use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::client::{CompletionBackend, CompletionRequest, RawCompletion};
use crate::config::GenerationSettings;
use crate::error::{EngineError, EngineResult};

/// OpenAI-compatible chat-completions endpoint.
pub struct HttpCompletionBackend {
    http_client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl HttpCompletionBackend {
    pub fn new(settings: &GenerationSettings) -> EngineResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<RawCompletion> {
        let url = format!("{}/v1/chat/completions", self.api_url);
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "metadata": { "provider": request.provider, "usage": request.usage },
        });

        let mut call = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await?;
        let status = response.status();

        let rate_limit = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<Vec<_>>();

        if !status.is_success() {
            return Err(EngineError::GenerationUnavailable(format!(
                "generation service returned status {}",
                status
            )));
        }

        let payload: Value = response.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                EngineError::GenerationUnavailable("response has no message content".to_string())
            })?
            .to_string();

        debug!(provider = %request.provider, usage = %request.usage, "Completion received");

        Ok(RawCompletion {
            content,
            rate_limit,
        })
    }
}
