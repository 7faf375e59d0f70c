use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ExamSettings;
use crate::metrics::record_answer;
use crate::models::content::{ChunkRecord, ConceptBrief};
use crate::models::progress::{ProgressWrite, SubmissionResult, SyncResult};
use crate::models::question::QuestionRecord;
use crate::models::{BloomLevel, Importance, Outcome, ResponseEvent, UsageType};
use crate::services::distribution::allocate;
use crate::services::generation::prompt::{build_context, clean_reference_images};
use crate::services::generation::{
    FollowUpInput, GenerationLog, GenerationPipeline, GenerationTask, InitialInput, TaskContext,
    TaskResult,
};
use crate::services::offline_queue::OfflineQueue;
use crate::services::progress_store::{apply_queued_write, ProgressStore};
use crate::services::scoring::{apply_response, summarize, ResultAccumulator, TestResultSummary};
use crate::services::srs::{calculate_submission_result, SubmissionInput};

/// Questions to draw from one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAllocation {
    pub chunk_id: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamPlan {
    pub course_id: String,
    pub importance: Importance,
    pub total: u32,
    /// Chunk order of the course.
    pub allocations: Vec<UnitAllocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparedExam {
    pub plan: ExamPlan,
    pub questions: Vec<QuestionRecord>,
    pub generated: u32,
    pub fallbacks: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerSubmission {
    pub user_id: String,
    pub question_id: String,
    pub outcome: Outcome,
    pub time_spent_ms: u64,
    pub session_number: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerReceipt {
    pub result: SubmissionResult,
    /// Write reached the store directly.
    pub persisted: bool,
    /// Offline queue entry holding the write when the store was unavailable.
    pub queued_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpRequest {
    pub user_id: String,
    pub question_id: String,
    pub incorrect_option: u8,
}

/// Wires planning, generation, scoring and persistence together for one
/// learner session.
pub struct SessionOrchestrator {
    store: Arc<dyn ProgressStore>,
    pipeline: Arc<GenerationPipeline>,
    queue: Arc<OfflineQueue>,
    exam: ExamSettings,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        pipeline: Arc<GenerationPipeline>,
        queue: Arc<OfflineQueue>,
        exam: ExamSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            queue,
            exam,
        }
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub async fn plan_exam(
        &self,
        user_id: &str,
        course_id: &str,
        total: Option<u32>,
    ) -> Result<ExamPlan> {
        let course = self
            .store
            .course(course_id)
            .await
            .context("Failed to load course")?
            .ok_or_else(|| anyhow!("Course not found: {}", course_id))?;
        let chunks = self
            .store
            .course_chunks(course_id)
            .await
            .context("Failed to load course chunks")?;

        let mut units = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let mastery = self
                .store
                .chunk_mastery(user_id, &chunk.id)
                .await
                .context("Failed to load chunk mastery")?
                .unwrap_or(0);
            units.push(chunk.to_unit(f64::from(mastery)));
        }

        let total = total.unwrap_or(self.exam.default_total);
        let mut counts = allocate(total, &units, course.importance);
        let allocations = chunks
            .iter()
            .map(|chunk| UnitAllocation {
                chunk_id: chunk.id.clone(),
                count: counts.remove(&chunk.id).unwrap_or(0),
            })
            .collect();

        info!(user_id, course_id, total, units = units.len(), "Exam planned");

        Ok(ExamPlan {
            course_id: course_id.to_string(),
            importance: course.importance,
            total,
            allocations,
        })
    }

    /// Plans the exam, reuses stored mock-exam questions and generates only the
    /// shortfall per chunk. Fallback placeholders are neither stored nor served.
    pub async fn prepare_exam(
        &self,
        user_id: &str,
        course_id: &str,
        total: Option<u32>,
        log: &dyn GenerationLog,
    ) -> Result<PreparedExam> {
        let plan = self.plan_exam(user_id, course_id, total).await?;
        let course = self
            .store
            .course(course_id)
            .await
            .context("Failed to load course")?
            .ok_or_else(|| anyhow!("Course not found: {}", course_id))?;

        let mut questions = Vec::new();
        let mut generated = 0;
        let mut fallbacks = 0;

        for allocation in plan.allocations.iter().filter(|a| a.count > 0) {
            let wanted = allocation.count as usize;
            let pool = self
                .store
                .question_pool(&allocation.chunk_id, UsageType::Exam, wanted)
                .await
                .context("Failed to load exam question pool")?;
            let shortfall = wanted.saturating_sub(pool.len());
            questions.extend(pool);

            if shortfall == 0 {
                continue;
            }

            let chunk = self
                .store
                .chunk(&allocation.chunk_id)
                .await
                .context("Failed to load chunk")?
                .ok_or_else(|| anyhow!("Chunk not found: {}", allocation.chunk_id))?;

            for index in 0..shortfall {
                let concept = concept_for(&chunk, index);
                let input = InitialInput {
                    chunk_id: chunk.id.clone(),
                    concept: concept.clone(),
                    chunk_content: chunk.content.clone(),
                    course_name: Some(course.name.clone()),
                    section_title: Some(chunk.section_title.clone()),
                    guidelines: course.guidelines.clone(),
                    learner_id: None,
                };

                let outcome = self
                    .pipeline
                    .run(input, log)
                    .await
                    .context("Question generation failed")?;
                if outcome.used_fallback {
                    fallbacks += 1;
                    continue;
                }

                let record = QuestionRecord {
                    id: Uuid::new_v4().to_string(),
                    chunk_id: chunk.id.clone(),
                    usage_type: UsageType::Exam,
                    bloom_level: outcome
                        .question
                        .bloom_level
                        .unwrap_or(BloomLevel::Knowledge),
                    concept_title: concept.title,
                    question_data: outcome.question,
                    created_for: None,
                    created_at: Utc::now(),
                };
                self.store
                    .save_question(&record)
                    .await
                    .context("Failed to save generated question")?;
                questions.push(record);
                generated += 1;
            }
        }

        questions.truncate(plan.total as usize);
        if fallbacks > 0 {
            warn!(course_id, fallbacks, "Exam prepared with missing questions");
        }
        info!(
            course_id,
            questions = questions.len(),
            generated,
            "Exam prepared"
        );

        Ok(PreparedExam {
            plan,
            questions,
            generated,
            fallbacks,
        })
    }

    /// Scores one answer and records it. When the store rejects the write it
    /// is parked in the offline queue instead of failing the submission.
    pub async fn submit_answer(&self, submission: &AnswerSubmission) -> Result<AnswerReceipt> {
        let question = self
            .store
            .question(&submission.question_id)
            .await
            .context("Failed to load question")?
            .ok_or_else(|| anyhow!("Question not found: {}", submission.question_id))?;
        let chunk = self
            .store
            .chunk(&question.chunk_id)
            .await
            .context("Failed to load chunk")?;
        let current = self
            .store
            .question_status(&submission.user_id, &submission.question_id)
            .await
            .context("Failed to load question status")?;
        let mastery = self
            .store
            .chunk_mastery(&submission.user_id, &question.chunk_id)
            .await
            .context("Failed to load chunk mastery")?
            .unwrap_or(0);
        let coverage = self
            .store
            .chunk_coverage(&submission.user_id, &question.chunk_id)
            .await
            .context("Failed to load chunk coverage")?;

        let result = calculate_submission_result(&SubmissionInput {
            current: current.as_ref(),
            outcome: submission.outcome,
            time_spent_ms: submission.time_spent_ms,
            usage_type: question.usage_type,
            bloom_level: question.bloom_level,
            chunk_content_len: chunk.as_ref().map(|c| c.content.chars().count()).unwrap_or(0),
            concept_count: chunk
                .as_ref()
                .map(ChunkRecord::concept_count)
                .filter(|count| *count > 0),
            current_mastery: mastery,
            unique_solved: coverage.unique_solved,
            total_chunk_questions: coverage.total_questions,
            session_number: submission.session_number,
        });
        record_answer(submission.outcome.as_str());

        if question.usage_type == UsageType::Exam {
            return Ok(AnswerReceipt {
                result,
                persisted: false,
                queued_id: None,
            });
        }

        let write = ProgressWrite {
            user_id: submission.user_id.clone(),
            question_id: submission.question_id.clone(),
            chunk_id: Some(question.chunk_id.clone()),
            session_number: submission.session_number,
            outcome: submission.outcome,
            time_spent_ms: submission.time_spent_ms,
            status: result.new_status,
            consecutive_success: result.new_success_count,
            consecutive_fails: result.new_fails_count,
            next_review_session: result.next_review_session,
            mastery_score: result.new_mastery,
            recorded_at: Utc::now(),
        };

        match self.store.upsert_progress(&write).await {
            Ok(()) => Ok(AnswerReceipt {
                result,
                persisted: true,
                queued_id: None,
            }),
            Err(err) => {
                warn!(
                    user_id = %write.user_id,
                    question_id = %write.question_id,
                    error = %err,
                    "Progress write failed, queueing for later sync"
                );
                let payload = write.queue_payload()?;
                let queued_id = self
                    .queue
                    .enqueue(payload)
                    .await
                    .context("Failed to queue progress write")?;
                Ok(AnswerReceipt {
                    result,
                    persisted: false,
                    queued_id: Some(queued_id),
                })
            }
        }
    }

    /// Generates a remedial question after a wrong answer. A failed generation
    /// comes back as an unsuccessful [`TaskResult`], not an error.
    pub async fn request_follow_up(
        &self,
        request: &FollowUpRequest,
        log: &dyn GenerationLog,
    ) -> Result<TaskResult> {
        let question = self
            .store
            .question(&request.question_id)
            .await
            .context("Failed to load question")?
            .ok_or_else(|| anyhow!("Question not found: {}", request.question_id))?;
        let chunk = self
            .store
            .chunk(&question.chunk_id)
            .await
            .context("Failed to load chunk")?
            .ok_or_else(|| anyhow!("Chunk not found: {}", question.chunk_id))?;
        let course = self
            .store
            .course(&chunk.course_id)
            .await
            .context("Failed to load course")?;

        let shared_context = build_context(
            &clean_reference_images(&chunk.content),
            course.as_ref().map(|c| c.name.as_str()),
            Some(chunk.section_title.as_str()),
            course.as_ref().and_then(|c| c.guidelines.as_ref()),
        );

        let task = GenerationTask::FollowUp(FollowUpInput {
            user_id: request.user_id.clone(),
            chunk_id: chunk.id.clone(),
            original_question_id: question.id.clone(),
            original_question: question.question_data.clone(),
            incorrect_option: request.incorrect_option,
            correct_option: question.question_data.answer_index,
            shared_context,
        });
        let ctx = TaskContext {
            client: self.pipeline.client().as_ref(),
            store: self.store.as_ref(),
            log,
        };
        let result = task.run(&ctx).await.context("Follow-up generation failed")?;

        if let Some(follow_up) = result.data.as_ref().filter(|_| result.success) {
            let record = QuestionRecord {
                id: Uuid::new_v4().to_string(),
                chunk_id: chunk.id.clone(),
                usage_type: UsageType::Practice,
                bloom_level: follow_up.bloom_level.unwrap_or(question.bloom_level),
                concept_title: question.concept_title.clone(),
                question_data: follow_up.clone(),
                created_for: Some(request.user_id.clone()),
                created_at: Utc::now(),
            };
            self.store
                .save_question(&record)
                .await
                .context("Failed to save follow-up question")?;
        }

        Ok(result)
    }

    /// Replays queued progress writes against the store.
    pub async fn flush_offline_queue(&self) -> Result<Vec<SyncResult>> {
        let store = self.store.clone();
        self.queue
            .sync(|payload| apply_queued_write(store.clone(), payload))
            .await
            .context("Failed to sync offline queue")
    }
}

/// Folds a finished session's responses into its summary.
pub fn summarize_session(events: &[ResponseEvent]) -> TestResultSummary {
    let accumulator = events.iter().fold(ResultAccumulator::default(), |acc, event| {
        apply_response(acc, event.outcome, event.time_spent_ms as f64)
    });
    summarize(&accumulator)
}

fn concept_for(chunk: &ChunkRecord, index: usize) -> ConceptBrief {
    if chunk.concepts.is_empty() {
        return ConceptBrief {
            title: chunk.section_title.clone(),
            bloom_level: None,
            focus: None,
        };
    }
    chunk.concepts[index % chunk.concepts.len()].clone()
}
