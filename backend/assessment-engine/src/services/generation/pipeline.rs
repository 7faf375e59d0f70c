use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::client::StructuredClient;
use super::review::QuestionValidator;
use super::tasks::{GenerationTask, InitialInput, RevisionInput, TaskContext};
use super::{fallback_question, GenerationLog, GenerationStep};
use crate::error::EngineResult;
use crate::metrics::record_fallback;
use crate::models::question::GeneratedQuestion;
use crate::services::progress_store::ProgressStore;

/// What the pipeline finally settled on for one concept.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub question: GeneratedQuestion,
    pub approved: bool,
    pub revisions: u32,
    pub used_fallback: bool,
}

impl PipelineOutcome {
    fn fallback(concept: Option<String>, revisions: u32) -> Self {
        Self {
            question: fallback_question(concept),
            approved: false,
            revisions,
            used_fallback: true,
        }
    }
}

/// Draft, validate, and revise until approved or out of rounds.
pub struct GenerationPipeline {
    client: Arc<StructuredClient>,
    validator: Arc<dyn QuestionValidator>,
    store: Arc<dyn ProgressStore>,
}

impl GenerationPipeline {
    pub fn new(
        client: Arc<StructuredClient>,
        validator: Arc<dyn QuestionValidator>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            client,
            validator,
            store,
        }
    }

    pub fn client(&self) -> &Arc<StructuredClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    pub async fn run(
        &self,
        input: InitialInput,
        log: &dyn GenerationLog,
    ) -> EngineResult<PipelineOutcome> {
        let ctx = TaskContext {
            client: &self.client,
            store: self.store.as_ref(),
            log,
        };
        let max_rounds = self.client.settings().max_revision_rounds;
        let source = input.source_text();
        let shared_context = input.shared_context();
        let concept = Some(input.concept.title.clone());

        let drafted = GenerationTask::Initial(input).run(&ctx).await?;
        if drafted.used_fallback() {
            return Ok(PipelineOutcome::fallback(concept, 0));
        }
        let Some(mut question) = drafted.data else {
            return Ok(PipelineOutcome::fallback(concept, 0));
        };

        let mut revisions = 0;
        loop {
            let Some(report) = self.validator.validate(&question, &source, log).await else {
                warn!(revisions, "No validation verdict, serving fallback");
                break;
            };

            if report.is_approved() {
                info!(revisions, score = report.total_score, "Question approved");
                return Ok(PipelineOutcome {
                    question,
                    approved: true,
                    revisions,
                    used_fallback: false,
                });
            }

            if revisions >= max_rounds {
                warn!(revisions, "Revision rounds exhausted, serving fallback");
                break;
            }

            let revised = GenerationTask::Revision(RevisionInput {
                rejected_question: question.clone(),
                report,
                shared_context: shared_context.clone(),
            })
            .run(&ctx)
            .await?;
            revisions += 1;

            match revised.data {
                Some(next) if !revised.used_fallback() => question = next,
                _ => return Ok(PipelineOutcome::fallback(question.concept.clone(), revisions)),
            }
        }

        record_fallback(GenerationStep::Pipeline.as_str());
        log.record(
            GenerationStep::Pipeline,
            "Question not approved, using fallback question",
            Some(&json!({ "revisions": revisions })),
        );
        Ok(PipelineOutcome::fallback(question.concept.clone(), revisions))
    }
}
