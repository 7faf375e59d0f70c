#![allow(dead_code)]

use assessment_engine::config::{GenerationSettings, SchedulerSettings};
use assessment_engine::error::{EngineError, EngineResult};
use assessment_engine::models::content::{ChunkCoverage, ChunkRecord, ConceptBrief, CourseRecord};
use assessment_engine::models::progress::{ProgressWrite, QuestionStatus};
use assessment_engine::models::question::{GeneratedQuestion, QuestionRecord};
use assessment_engine::models::{BloomLevel, Importance, UsageType};
use assessment_engine::services::generation::{
    CompletionBackend, CompletionRequest, GenerationLog, GenerationStep, RawCompletion,
    StructuredClient,
};
use assessment_engine::services::progress_store::ProgressStore;
use assessment_engine::services::scheduler::RateLimitScheduler;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// In-memory persistence with switchable read/write outages. Like the Mongo
/// store, it ignores writes older than the record it already holds.
#[derive(Default)]
pub struct MemoryStore {
    pub courses: Mutex<HashMap<String, CourseRecord>>,
    pub chunks: Mutex<Vec<ChunkRecord>>,
    pub questions: Mutex<Vec<QuestionRecord>>,
    pub progress: Mutex<HashMap<String, ProgressWrite>>,
    pub mastery: Mutex<HashMap<String, u32>>,
    pub mastery_stamps: Mutex<HashMap<String, DateTime<Utc>>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_course(&self, course: CourseRecord) {
        self.courses.lock().unwrap().insert(course.id.clone(), course);
    }

    pub fn add_chunk(&self, chunk: ChunkRecord) {
        self.chunks.lock().unwrap().push(chunk);
    }

    pub fn add_question(&self, record: QuestionRecord) {
        self.questions.lock().unwrap().push(record);
    }

    pub fn set_mastery(&self, user_id: &str, chunk_id: &str, score: u32) {
        self.mastery
            .lock()
            .unwrap()
            .insert(format!("{}:{}", user_id, chunk_id), score);
    }

    pub fn set_status(&self, status: QuestionStatus) {
        let write = ProgressWrite {
            user_id: status.user_id.clone(),
            question_id: status.question_id.clone(),
            chunk_id: None,
            session_number: 1,
            outcome: assessment_engine::models::Outcome::Incorrect,
            time_spent_ms: 0,
            status: status.status,
            consecutive_success: status.consecutive_success,
            consecutive_fails: status.consecutive_fails,
            next_review_session: status.next_review_session,
            mastery_score: 0,
            recorded_at: Utc::now(),
        };
        self.progress.lock().unwrap().insert(write.record_id(), write);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn progress_for(&self, user_id: &str, question_id: &str) -> Option<ProgressWrite> {
        self.progress
            .lock()
            .unwrap()
            .get(&format!("{}:{}", user_id, question_id))
            .cloned()
    }

    pub fn question_count(&self) -> usize {
        self.questions.lock().unwrap().len()
    }

    fn check_read(&self) -> EngineResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::PersistenceRead("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn course(&self, course_id: &str) -> EngineResult<Option<CourseRecord>> {
        self.check_read()?;
        Ok(self.courses.lock().unwrap().get(course_id).cloned())
    }

    async fn course_chunks(&self, course_id: &str) -> EngineResult<Vec<ChunkRecord>> {
        self.check_read()?;
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn chunk(&self, chunk_id: &str) -> EngineResult<Option<ChunkRecord>> {
        self.check_read()?;
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == chunk_id)
            .cloned())
    }

    async fn chunk_mastery(&self, user_id: &str, chunk_id: &str) -> EngineResult<Option<u32>> {
        self.check_read()?;
        Ok(self
            .mastery
            .lock()
            .unwrap()
            .get(&format!("{}:{}", user_id, chunk_id))
            .copied())
    }

    async fn chunk_coverage(&self, user_id: &str, chunk_id: &str) -> EngineResult<ChunkCoverage> {
        self.check_read()?;
        let total = self
            .questions
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.chunk_id == chunk_id && q.usage_type != UsageType::Exam)
            .count() as u32;
        let solved = self
            .progress
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.user_id == user_id && p.chunk_id.as_deref() == Some(chunk_id))
            .count() as u32;
        Ok(ChunkCoverage {
            unique_solved: solved,
            total_questions: total,
        })
    }

    async fn question(&self, question_id: &str) -> EngineResult<Option<QuestionRecord>> {
        self.check_read()?;
        Ok(self
            .questions
            .lock()
            .unwrap()
            .iter()
            .find(|q| q.id == question_id)
            .cloned())
    }

    async fn question_pool(
        &self,
        chunk_id: &str,
        usage: UsageType,
        limit: usize,
    ) -> EngineResult<Vec<QuestionRecord>> {
        self.check_read()?;
        Ok(self
            .questions
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.chunk_id == chunk_id && q.usage_type == usage)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn question_status(
        &self,
        user_id: &str,
        question_id: &str,
    ) -> EngineResult<Option<QuestionStatus>> {
        self.check_read()?;
        Ok(self.progress_for(user_id, question_id).map(|w| QuestionStatus {
            user_id: w.user_id,
            question_id: w.question_id,
            status: w.status,
            consecutive_success: w.consecutive_success,
            consecutive_fails: w.consecutive_fails,
            next_review_session: w.next_review_session,
        }))
    }

    async fn recent_diagnoses(
        &self,
        user_id: &str,
        chunk_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        self.check_read()?;
        let mut records: Vec<QuestionRecord> = self
            .questions
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.chunk_id == chunk_id && q.created_for.as_deref() == Some(user_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .filter_map(|r| r.question_data.diagnosis)
            .take(limit)
            .collect())
    }

    async fn save_question(&self, record: &QuestionRecord) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::PersistenceWrite("store offline".into()));
        }
        let mut questions = self.questions.lock().unwrap();
        questions.retain(|q| q.id != record.id);
        questions.push(record.clone());
        Ok(())
    }

    async fn upsert_progress(&self, write: &ProgressWrite) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::PersistenceWrite("store offline".into()));
        }
        if let Some(chunk_id) = &write.chunk_id {
            let key = format!("{}:{}", write.user_id, chunk_id);
            let mut stamps = self.mastery_stamps.lock().unwrap();
            if stamps.get(&key).map_or(true, |at| *at <= write.recorded_at) {
                stamps.insert(key, write.recorded_at);
                self.set_mastery(&write.user_id, chunk_id, write.mastery_score);
            }
        }
        let mut progress = self.progress.lock().unwrap();
        let newer_stored = progress
            .get(&write.record_id())
            .is_some_and(|stored| stored.recorded_at > write.recorded_at);
        if !newer_stored {
            progress.insert(write.record_id(), write.clone());
        }
        Ok(())
    }
}

/// Completion backend that replays a fixed script of responses.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<EngineResult<RawCompletion>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.script.lock().unwrap().push_back(Ok(RawCompletion {
            content: content.into(),
            rate_limit: Vec::new(),
        }));
    }

    pub fn push_json(&self, value: Value) {
        self.push_text(value.to_string());
    }

    pub fn push_with_headers(&self, value: Value, headers: &[(&str, &str)]) {
        self.script.lock().unwrap().push_back(Ok(RawCompletion {
            content: value.to_string(),
            rate_limit: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }));
    }

    pub fn push_error(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(EngineError::GenerationUnavailable("connection reset".into())));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> CompletionRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> EngineResult<RawCompletion> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::GenerationUnavailable("script exhausted".into())))
    }
}

/// Generation log that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingLog {
    pub events: Mutex<Vec<(GenerationStep, String)>>,
}

impl RecordingLog {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl GenerationLog for RecordingLog {
    fn record(&self, step: GenerationStep, message: &str, _details: Option<&Value>) {
        self.events.lock().unwrap().push((step, message.to_string()));
    }
}

pub fn generation_settings() -> GenerationSettings {
    GenerationSettings {
        max_structured_retries: 1,
        max_revision_rounds: 2,
        max_revision_retries: 1,
        ..GenerationSettings::default()
    }
}

pub fn structured_client(backend: Arc<ScriptedBackend>) -> Arc<StructuredClient> {
    Arc::new(StructuredClient::new(
        Arc::new(RateLimitScheduler::new(SchedulerSettings::default())),
        backend,
        generation_settings(),
    ))
}

pub fn question_json(stem: &str) -> Value {
    json!({
        "q": stem,
        "o": ["Alpha", "Beta", "Gamma", "Delta", "Epsilon"],
        "a": 1,
        "exp": "Beta is correct because the passage says so.",
        "evidence": "The passage names Beta.",
        "img": null,
        "diagnosis": "Confuses Alpha with Beta.",
    })
}

pub fn verdict_json(approved: bool) -> Value {
    if approved {
        json!({
            "total_score": 92,
            "decision": "APPROVED",
            "critical_faults": [],
            "improvement_suggestion": "",
        })
    } else {
        json!({
            "total_score": 40,
            "decision": "REJECTED",
            "critical_faults": ["Two options are correct"],
            "improvement_suggestion": "Make Gamma clearly wrong.",
        })
    }
}

pub fn sample_question(stem: &str, level: BloomLevel) -> GeneratedQuestion {
    let mut question: GeneratedQuestion =
        serde_json::from_value(question_json(stem)).expect("fixture question parses");
    question.bloom_level = Some(level);
    question.concept = Some("Osmosis".to_string());
    question
}

pub fn course(id: &str, importance: Importance) -> CourseRecord {
    CourseRecord {
        id: id.to_string(),
        name: "Biology".to_string(),
        importance,
        guidelines: None,
    }
}

pub fn chunk(id: &str, course_id: &str, concepts: usize, difficulty: f64) -> ChunkRecord {
    ChunkRecord {
        id: id.to_string(),
        course_id: course_id.to_string(),
        section_title: format!("Section {}", id),
        content: "Water moves across a semi-permeable membrane toward higher solute concentration."
            .to_string(),
        concepts: (0..concepts)
            .map(|i| ConceptBrief {
                title: format!("Concept {}", i + 1),
                bloom_level: Some(BloomLevel::Knowledge),
                focus: None,
            })
            .collect(),
        difficulty_index: difficulty,
    }
}

pub fn question_record(
    id: &str,
    chunk_id: &str,
    usage_type: UsageType,
    level: BloomLevel,
) -> QuestionRecord {
    QuestionRecord {
        id: id.to_string(),
        chunk_id: chunk_id.to_string(),
        usage_type,
        bloom_level: level,
        concept_title: "Osmosis".to_string(),
        question_data: sample_question(&format!("Which statement about {} holds?", id), level),
        created_for: None,
        created_at: Utc::now() - Duration::minutes(5),
    }
}
