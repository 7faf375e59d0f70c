use serde_json::json;
use tracing::{info, warn};

use super::client::{GenerateOptions, StructuredClient};
use super::prompt::{
    assemble, build_context, clean_reference_images, follow_up_task, initial_task, revision_task,
    system_prompt, FollowUpPrompt, REVISION_RETRY_PROMPT,
};
use super::{GenerationLog, GenerationStep, TaskMetadata, TaskResult};
use crate::error::EngineResult;
use crate::metrics::record_fallback;
use crate::models::content::{ConceptBrief, Guidelines};
use crate::models::question::{GeneratedQuestion, ValidationReport};
use crate::models::BloomLevel;
use crate::services::progress_store::ProgressStore;

const RECENT_DIAGNOSES_LIMIT: usize = 3;
const SCAFFOLDING_FAIL_THRESHOLD: u32 = 2;

/// Collaborators shared by every task in one run.
pub struct TaskContext<'a> {
    pub client: &'a StructuredClient,
    pub store: &'a dyn ProgressStore,
    pub log: &'a dyn GenerationLog,
}

/// First draft of a question for one concept of a chunk.
#[derive(Debug, Clone)]
pub struct InitialInput {
    pub chunk_id: String,
    pub concept: ConceptBrief,
    pub chunk_content: String,
    pub course_name: Option<String>,
    pub section_title: Option<String>,
    pub guidelines: Option<Guidelines>,
    /// When set, the learner's recent mistakes on this chunk steer the prompt.
    pub learner_id: Option<String>,
}

impl InitialInput {
    pub fn source_text(&self) -> String {
        clean_reference_images(&self.chunk_content)
    }

    /// Context block reused by the revision rounds.
    pub fn shared_context(&self) -> String {
        build_context(
            &self.source_text(),
            self.course_name.as_deref(),
            self.section_title.as_deref(),
            self.guidelines.as_ref(),
        )
    }

    fn target_level(&self) -> BloomLevel {
        self.concept.bloom_level.unwrap_or(BloomLevel::Knowledge)
    }
}

#[derive(Debug, Clone)]
pub struct RevisionInput {
    pub rejected_question: GeneratedQuestion,
    pub report: ValidationReport,
    pub shared_context: String,
}

/// Remedial question after a learner picked `incorrect_option`.
#[derive(Debug, Clone)]
pub struct FollowUpInput {
    pub user_id: String,
    pub chunk_id: String,
    pub original_question_id: String,
    pub original_question: GeneratedQuestion,
    pub incorrect_option: u8,
    pub correct_option: u8,
    pub shared_context: String,
}

#[derive(Debug, Clone)]
pub enum GenerationTask {
    Initial(InitialInput),
    Revision(RevisionInput),
    FollowUp(FollowUpInput),
}

impl GenerationTask {
    pub fn step(&self) -> GenerationStep {
        match self {
            GenerationTask::Initial(_) => GenerationStep::Initial,
            GenerationTask::Revision(_) => GenerationStep::Revision,
            GenerationTask::FollowUp(_) => GenerationStep::FollowUp,
        }
    }

    /// Content-quality problems end up in the returned [`TaskResult`]; only
    /// collaborator failures such as a broken progress lookup are `Err`.
    pub async fn run(&self, ctx: &TaskContext<'_>) -> EngineResult<TaskResult> {
        match self {
            GenerationTask::Initial(input) => run_initial(input, ctx).await,
            GenerationTask::Revision(input) => Ok(run_revision(input, ctx).await),
            GenerationTask::FollowUp(input) => run_follow_up(input, ctx).await,
        }
    }
}

fn system_message(client: &StructuredClient) -> String {
    system_prompt(client.settings().system_prompt_prefix.as_deref())
}

async fn run_initial(input: &InitialInput, ctx: &TaskContext<'_>) -> EngineResult<TaskResult> {
    let step = GenerationStep::Initial;
    ctx.log.record(
        step,
        &format!("Drafting question for \"{}\"", input.concept.title),
        None,
    );

    let previous_diagnoses = match &input.learner_id {
        Some(user_id) => {
            ctx.store
                .recent_diagnoses(user_id, &input.chunk_id, RECENT_DIAGNOSES_LIMIT)
                .await?
        }
        None => Vec::new(),
    };

    let level = input.target_level();
    let messages = assemble(
        &system_message(ctx.client),
        &input.shared_context(),
        &initial_task(
            &input.concept.title,
            level,
            input.concept.focus.as_deref(),
            &previous_diagnoses,
        ),
    );
    let options = GenerateOptions::new(
        step,
        "drafting",
        ctx.client.settings().max_structured_retries,
    );

    match ctx.client.generate::<GeneratedQuestion>(&messages, options, ctx.log).await {
        Some(mut question) => {
            question.bloom_level = Some(level);
            question.concept = Some(input.concept.title.clone());
            Ok(TaskResult::generated(
                question,
                TaskMetadata {
                    target_bloom_level: Some(level),
                    ..TaskMetadata::default()
                },
            ))
        }
        None => {
            warn!(concept = %input.concept.title, "Drafting exhausted retries, serving fallback");
            record_fallback(step.as_str());
            ctx.log.record(step, "Drafting failed, using fallback question", None);
            Ok(TaskResult::fallback(Some(input.concept.title.clone())))
        }
    }
}

async fn run_revision(input: &RevisionInput, ctx: &TaskContext<'_>) -> TaskResult {
    let step = GenerationStep::Revision;
    ctx.log.record(
        step,
        "Revising question",
        Some(&json!({ "critical_faults": input.report.critical_faults })),
    );

    let messages = assemble(
        &system_message(ctx.client),
        &input.shared_context,
        &revision_task(&input.rejected_question, &input.report),
    );
    let options = GenerateOptions::new(
        step,
        "revision",
        ctx.client.settings().max_revision_retries,
    )
    .with_retry_prompt(REVISION_RETRY_PROMPT);

    let original = &input.rejected_question;
    match ctx.client.generate::<GeneratedQuestion>(&messages, options, ctx.log).await {
        Some(mut revised) => {
            revised.bloom_level = original.bloom_level;
            revised.image_index = original.image_index;
            revised.concept = original.concept.clone();
            TaskResult::generated(
                revised,
                TaskMetadata {
                    target_bloom_level: original.bloom_level,
                    ..TaskMetadata::default()
                },
            )
        }
        None => {
            warn!("Revision exhausted retries, serving fallback");
            record_fallback(step.as_str());
            ctx.log.record(step, "Revision failed, using fallback question", None);
            TaskResult::fallback(original.concept.clone())
        }
    }
}

async fn run_follow_up(input: &FollowUpInput, ctx: &TaskContext<'_>) -> EngineResult<TaskResult> {
    let step = GenerationStep::FollowUp;
    ctx.log.record(step, "Generating follow-up question", None);

    let status = ctx
        .store
        .question_status(&input.user_id, &input.original_question_id)
        .await?;
    let consecutive_fails = status.map(|s| s.consecutive_fails).unwrap_or(0);

    let original = &input.original_question;
    let mut level = original.bloom_level.unwrap_or(BloomLevel::Application);
    let mut scaffolding_note = None;
    if consecutive_fails >= SCAFFOLDING_FAIL_THRESHOLD {
        level = level.step_down();
        scaffolding_note = Some(format!(
            "SCAFFOLDING ACTIVE: the learner has missed this {} times in a row. \
             Write the question one cognitive level lower ({}).",
            consecutive_fails, level
        ));
        info!(
            user_id = %input.user_id,
            consecutive_fails,
            target = %level,
            "Scaffolding follow-up question"
        );
    }

    let previous_diagnoses = ctx
        .store
        .recent_diagnoses(&input.user_id, &input.chunk_id, RECENT_DIAGNOSES_LIMIT)
        .await?;

    let task = follow_up_task(&FollowUpPrompt {
        evidence: &original.evidence,
        original,
        incorrect_option: input.incorrect_option,
        correct_option: input.correct_option,
        target_level: level,
        scaffolding_note: scaffolding_note.as_deref(),
        previous_diagnoses: &previous_diagnoses,
    });
    let messages = assemble(&system_message(ctx.client), &input.shared_context, &task);
    let options = GenerateOptions::new(
        step,
        "follow_up",
        ctx.client.settings().max_structured_retries,
    );

    match ctx.client.generate::<GeneratedQuestion>(&messages, options, ctx.log).await {
        Some(mut question) => {
            question.bloom_level = Some(level);
            question.image_index = original.image_index;
            question.concept = original.concept.clone();
            Ok(TaskResult::generated(
                question,
                TaskMetadata {
                    used_fallback: false,
                    target_bloom_level: Some(level),
                    scaffolded: scaffolding_note.is_some(),
                },
            ))
        }
        None => {
            warn!(user_id = %input.user_id, "Follow-up generation failed");
            ctx.log.record(step, "Follow-up generation failed", None);
            Ok(TaskResult::failure("follow-up question could not be generated"))
        }
    }
}
