use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use validator::Validate;

use super::parser::extract_json;
use super::prompt::{PromptMessage, DEFAULT_RETRY_PROMPT};
use super::{GenerationLog, GenerationStep};
use crate::config::GenerationSettings;
use crate::error::EngineResult;
use crate::metrics::record_generation_attempt;
use crate::services::scheduler::RateLimitScheduler;

/// One chat-completion call.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    /// Free-form tag describing what the call is for.
    pub usage: String,
}

/// Raw model output plus the rate-limit metadata that came with it.
#[derive(Debug, Clone, Default)]
pub struct RawCompletion {
    pub content: String,
    pub rate_limit: Vec<(String, String)>,
}

/// Transport to the generation service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<RawCompletion>;
}

/// Per-call knobs for [`StructuredClient::generate`].
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions<'a> {
    pub step: GenerationStep,
    pub usage: &'a str,
    pub max_retries: u32,
    pub retry_prompt: &'a str,
    pub temperature: Option<f32>,
}

impl<'a> GenerateOptions<'a> {
    pub fn new(step: GenerationStep, usage: &'a str, max_retries: u32) -> Self {
        Self {
            step,
            usage,
            max_retries,
            retry_prompt: DEFAULT_RETRY_PROMPT,
            temperature: None,
        }
    }

    pub fn with_retry_prompt(mut self, retry_prompt: &'a str) -> Self {
        self.retry_prompt = retry_prompt;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Schema-checked generation through the rate-limit scheduler.
///
/// Transport errors, unparseable output and schema violations are all treated
/// as a failed attempt; after `max_retries` extra attempts the call yields
/// `None`.
pub struct StructuredClient {
    scheduler: Arc<RateLimitScheduler>,
    backend: Arc<dyn CompletionBackend>,
    settings: GenerationSettings,
}

impl StructuredClient {
    pub fn new(
        scheduler: Arc<RateLimitScheduler>,
        backend: Arc<dyn CompletionBackend>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            scheduler,
            backend,
            settings,
        }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub async fn generate<T>(
        &self,
        messages: &[PromptMessage],
        options: GenerateOptions<'_>,
        log: &dyn GenerationLog,
    ) -> Option<T>
    where
        T: DeserializeOwned + Validate,
    {
        let provider = self.settings.provider.as_str();
        let task = options.step.as_str();

        for attempt in 0..=options.max_retries {
            let mut current = messages.to_vec();
            if attempt > 0 {
                current.push(PromptMessage::user(options.retry_prompt));
                log.record(options.step, &format!("Retry attempt #{}", attempt), None);
            }

            let request = CompletionRequest {
                messages: current,
                provider: provider.to_string(),
                model: self.settings.model.clone(),
                temperature: options.temperature.unwrap_or(self.settings.temperature),
                usage: options.usage.to_string(),
            };

            let response = self
                .scheduler
                .schedule(provider, || self.backend.complete(&request))
                .await;

            let raw = match response {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(task, attempt, error = %err, "Generation call failed");
                    record_generation_attempt(task, "transport_error");
                    log.record(
                        options.step,
                        &format!("Generation error (attempt {})", attempt + 1),
                        Some(&json!({ "error": err.to_string() })),
                    );
                    continue;
                }
            };

            self.scheduler.sync_headers(
                raw.rate_limit.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                provider,
            );

            let Some(value) = extract_json(&raw.content) else {
                record_generation_attempt(task, "parse_error");
                log.record(
                    options.step,
                    &format!("JSON parse error (attempt {})", attempt + 1),
                    Some(&json!({ "raw_content": raw.content })),
                );
                continue;
            };

            let parsed = serde_json::from_value::<T>(value)
                .map_err(|e| e.to_string())
                .and_then(|candidate| match candidate.validate() {
                    Ok(()) => Ok(candidate),
                    Err(errors) => Err(errors.to_string()),
                });

            match parsed {
                Ok(candidate) => {
                    debug!(task, attempt, "Structured generation succeeded");
                    record_generation_attempt(task, "success");
                    return Some(candidate);
                }
                Err(error) => {
                    record_generation_attempt(task, "schema_error");
                    log.record(
                        options.step,
                        &format!("Schema validation error (attempt {})", attempt + 1),
                        Some(&json!({ "error": error, "raw_content": raw.content })),
                    );
                }
            }
        }

        None
    }
}
