use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::client::{GenerateOptions, StructuredClient};
use super::prompt::{assemble, validation_context, validation_task, VALIDATION_SYSTEM_PROMPT};
use super::{GenerationLog, GenerationStep};
use crate::metrics::VALIDATION_DECISIONS_TOTAL;
use crate::models::question::{GeneratedQuestion, ValidationReport};

/// Quality gate between drafting and serving a question.
#[async_trait]
pub trait QuestionValidator: Send + Sync {
    /// `None` means no verdict could be obtained.
    async fn validate(
        &self,
        question: &GeneratedQuestion,
        source: &str,
        log: &dyn GenerationLog,
    ) -> Option<ValidationReport>;
}

/// Asks the generation service to review the question against its source.
pub struct ModelValidator {
    client: Arc<StructuredClient>,
}

impl ModelValidator {
    pub fn new(client: Arc<StructuredClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QuestionValidator for ModelValidator {
    async fn validate(
        &self,
        question: &GeneratedQuestion,
        source: &str,
        log: &dyn GenerationLog,
    ) -> Option<ValidationReport> {
        let messages = assemble(
            VALIDATION_SYSTEM_PROMPT,
            &validation_context(source),
            &validation_task(question),
        );
        let options = GenerateOptions::new(
            GenerationStep::Validation,
            "validation",
            self.client.settings().max_structured_retries,
        );

        let report: ValidationReport = self.client.generate(&messages, options, log).await?;

        let decision = if report.is_approved() { "approved" } else { "rejected" };
        VALIDATION_DECISIONS_TOTAL.with_label_values(&[decision]).inc();
        info!(decision, score = report.total_score, "Validation verdict");
        log.record(
            GenerationStep::Validation,
            &format!("Validation {}", decision),
            Some(&json!({
                "score": report.total_score,
                "critical_faults": report.critical_faults,
            })),
        );

        Some(report)
    }
}
