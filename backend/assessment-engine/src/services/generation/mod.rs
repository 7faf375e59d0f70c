//! AI question generation: prompts, structured calls, typed tasks and the
//! draft → validate → revise pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::models::question::GeneratedQuestion;
use crate::models::BloomLevel;

pub mod client;
pub mod http;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod review;
pub mod tasks;

pub use client::{CompletionBackend, CompletionRequest, GenerateOptions, RawCompletion, StructuredClient};
pub use http::HttpCompletionBackend;
pub use parser::extract_json;
pub use pipeline::{GenerationPipeline, PipelineOutcome};
pub use review::{ModelValidator, QuestionValidator};
pub use tasks::{FollowUpInput, GenerationTask, InitialInput, RevisionInput, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStep {
    Initial,
    Revision,
    FollowUp,
    Validation,
    Pipeline,
}

impl GenerationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStep::Initial => "initial",
            GenerationStep::Revision => "revision",
            GenerationStep::FollowUp => "follow_up",
            GenerationStep::Validation => "validation",
            GenerationStep::Pipeline => "pipeline",
        }
    }
}

/// Progress sink for a single generation run.
pub trait GenerationLog: Send + Sync {
    fn record(&self, step: GenerationStep, message: &str, details: Option<&Value>);
}

/// Forwards generation events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl GenerationLog for TracingLog {
    fn record(&self, step: GenerationStep, message: &str, details: Option<&Value>) {
        match details {
            Some(details) => info!(step = step.as_str(), %details, "{}", message),
            None => info!(step = step.as_str(), "{}", message),
        }
    }
}

/// Extra facts about how a task produced its question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bloom_level: Option<BloomLevel>,
    #[serde(default)]
    pub scaffolded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<GeneratedQuestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TaskMetadata>,
}

impl TaskResult {
    pub fn generated(question: GeneratedQuestion, metadata: TaskMetadata) -> Self {
        Self {
            success: true,
            data: Some(question),
            error: None,
            metadata: Some(metadata),
        }
    }

    pub fn fallback(concept: Option<String>) -> Self {
        Self::generated(
            fallback_question(concept),
            TaskMetadata {
                used_fallback: true,
                ..TaskMetadata::default()
            },
        )
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn used_fallback(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.used_fallback)
    }
}

/// Placeholder served when generation gives up.
pub fn fallback_question(concept: Option<String>) -> GeneratedQuestion {
    GeneratedQuestion {
        question: "This question could not be prepared right now. Continue with the next one."
            .to_string(),
        options: ["Continue", "Retry", "Skip", "Done", "Help"]
            .iter()
            .map(|o| o.to_string())
            .collect(),
        answer_index: 0,
        explanation: "Question generation was unavailable, so this placeholder was shown instead."
            .to_string(),
        evidence: "Not available.".to_string(),
        image_index: None,
        diagnosis: None,
        insight: None,
        bloom_level: Some(BloomLevel::Knowledge),
        concept,
    }
}
