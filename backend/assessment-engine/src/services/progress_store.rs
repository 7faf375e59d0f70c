//! Persistence collaborator: learner progress, content chunks and the
//! question pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ReplaceOptions;
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::metrics::track_store_operation;
use crate::models::content::{ChunkCoverage, ChunkRecord, CourseRecord};
use crate::models::progress::{ProgressWrite, QuestionStatus};
use crate::models::question::QuestionRecord;
use crate::models::UsageType;

/// Reads fail with a typed error and are never retried here. Writes are
/// idempotent upserts keyed by stable ids. A write older than what the store
/// already holds for a record leaves that record alone, so replaying queued
/// writes after newer direct ones is safe.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn course(&self, course_id: &str) -> EngineResult<Option<CourseRecord>>;

    async fn course_chunks(&self, course_id: &str) -> EngineResult<Vec<ChunkRecord>>;

    async fn chunk(&self, chunk_id: &str) -> EngineResult<Option<ChunkRecord>>;

    async fn chunk_mastery(&self, user_id: &str, chunk_id: &str) -> EngineResult<Option<u32>>;

    async fn chunk_coverage(&self, user_id: &str, chunk_id: &str) -> EngineResult<ChunkCoverage>;

    async fn question(&self, question_id: &str) -> EngineResult<Option<QuestionRecord>>;

    async fn question_pool(
        &self,
        chunk_id: &str,
        usage: UsageType,
        limit: usize,
    ) -> EngineResult<Vec<QuestionRecord>>;

    async fn question_status(
        &self,
        user_id: &str,
        question_id: &str,
    ) -> EngineResult<Option<QuestionStatus>>;

    /// Most recent diagnosis notes written for this learner on this chunk,
    /// newest first.
    async fn recent_diagnoses(
        &self,
        user_id: &str,
        chunk_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>>;

    async fn save_question(&self, record: &QuestionRecord) -> EngineResult<()>;

    async fn upsert_progress(&self, write: &ProgressWrite) -> EngineResult<()>;
}

/// Replays one offline-queue payload as a progress upsert.
pub async fn apply_queued_write(store: Arc<dyn ProgressStore>, payload: Value) -> EngineResult<()> {
    let write: ProgressWrite = serde_json::from_value(payload)?;
    store.upsert_progress(&write).await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProgressDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    write: ProgressWrite,
    #[serde(default)]
    recorded_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MasteryDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    chunk_id: String,
    mastery_score: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    updated_at_ms: i64,
}

fn write_error(err: mongodb::error::Error) -> EngineError {
    EngineError::PersistenceWrite(err.to_string())
}

fn upsert() -> ReplaceOptions {
    ReplaceOptions::builder().upsert(true).build()
}

/// Matches document `id` unless its `stamp_field` is newer than `at_ms`.
/// Used with upsert, a newer stored copy makes the insert collide on `_id`.
fn unless_newer(id: &str, stamp_field: &str, at_ms: i64) -> Document {
    doc! {
        "_id": id,
        "$or": [
            { stamp_field: { "$lte": at_ms } },
            { stamp_field: { "$exists": false } },
        ],
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

pub struct MongoProgressStore {
    db: Database,
}

impl MongoProgressStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn courses(&self) -> Collection<CourseRecord> {
        self.db.collection("courses")
    }

    fn chunks(&self) -> Collection<ChunkRecord> {
        self.db.collection("chunks")
    }

    fn questions(&self) -> Collection<QuestionRecord> {
        self.db.collection("questions")
    }

    fn progress(&self) -> Collection<ProgressDocument> {
        self.db.collection("user_progress")
    }

    fn mastery(&self) -> Collection<MasteryDocument> {
        self.db.collection("chunk_mastery")
    }
}

#[async_trait]
impl ProgressStore for MongoProgressStore {
    async fn course(&self, course_id: &str) -> EngineResult<Option<CourseRecord>> {
        track_store_operation("course", async {
            Ok::<_, EngineError>(self.courses().find_one(doc! { "_id": course_id }).await?)
        })
        .await
    }

    async fn course_chunks(&self, course_id: &str) -> EngineResult<Vec<ChunkRecord>> {
        track_store_operation("course_chunks", async {
            let cursor = self
                .chunks()
                .find(doc! { "course_id": course_id })
                .sort(doc! { "_id": 1 })
                .await?;
            Ok::<_, EngineError>(cursor.try_collect::<Vec<_>>().await?)
        })
        .await
    }

    async fn chunk(&self, chunk_id: &str) -> EngineResult<Option<ChunkRecord>> {
        track_store_operation("chunk", async {
            Ok::<_, EngineError>(self.chunks().find_one(doc! { "_id": chunk_id }).await?)
        })
        .await
    }

    async fn chunk_mastery(&self, user_id: &str, chunk_id: &str) -> EngineResult<Option<u32>> {
        let id = format!("{}:{}", user_id, chunk_id);
        track_store_operation("chunk_mastery", async {
            let found = self.mastery().find_one(doc! { "_id": &id }).await?;
            Ok::<_, EngineError>(found.map(|m| m.mastery_score))
        })
        .await
    }

    async fn chunk_coverage(&self, user_id: &str, chunk_id: &str) -> EngineResult<ChunkCoverage> {
        track_store_operation("chunk_coverage", async {
            let total = self
                .questions()
                .count_documents(doc! {
                    "chunk_id": chunk_id,
                    "usage_type": { "$ne": UsageType::Exam.as_str() },
                })
                .await?;
            let solved = self
                .progress()
                .count_documents(doc! { "user_id": user_id, "chunk_id": chunk_id })
                .await?;

            Ok::<_, EngineError>(ChunkCoverage {
                unique_solved: u32::try_from(solved).unwrap_or(u32::MAX),
                total_questions: u32::try_from(total).unwrap_or(u32::MAX),
            })
        })
        .await
    }

    async fn question(&self, question_id: &str) -> EngineResult<Option<QuestionRecord>> {
        track_store_operation("question", async {
            Ok::<_, EngineError>(self.questions().find_one(doc! { "_id": question_id }).await?)
        })
        .await
    }

    async fn question_pool(
        &self,
        chunk_id: &str,
        usage: UsageType,
        limit: usize,
    ) -> EngineResult<Vec<QuestionRecord>> {
        track_store_operation("question_pool", async {
            let cursor = self
                .questions()
                .find(doc! { "chunk_id": chunk_id, "usage_type": usage.as_str() })
                .sort(doc! { "created_at": 1 })
                .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                .await?;
            Ok::<_, EngineError>(cursor.try_collect::<Vec<_>>().await?)
        })
        .await
    }

    async fn question_status(
        &self,
        user_id: &str,
        question_id: &str,
    ) -> EngineResult<Option<QuestionStatus>> {
        let id = format!("{}:{}", user_id, question_id);
        track_store_operation("question_status", async {
            let found = self.progress().find_one(doc! { "_id": &id }).await?;
            Ok::<_, EngineError>(found.map(|doc| QuestionStatus {
                user_id: doc.write.user_id,
                question_id: doc.write.question_id,
                status: doc.write.status,
                consecutive_success: doc.write.consecutive_success,
                consecutive_fails: doc.write.consecutive_fails,
                next_review_session: doc.write.next_review_session,
            }))
        })
        .await
    }

    async fn recent_diagnoses(
        &self,
        user_id: &str,
        chunk_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        track_store_operation("recent_diagnoses", async {
            let cursor = self
                .questions()
                .find(doc! {
                    "chunk_id": chunk_id,
                    "created_for": user_id,
                    "question_data.diagnosis": { "$exists": true, "$ne": null },
                })
                .sort(doc! { "created_at": -1 })
                .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                .await?;
            let records: Vec<QuestionRecord> = cursor.try_collect().await?;
            Ok::<_, EngineError>(records
                .into_iter()
                .filter_map(|r| r.question_data.diagnosis)
                .collect())
        })
        .await
    }

    async fn save_question(&self, record: &QuestionRecord) -> EngineResult<()> {
        track_store_operation("save_question", async {
            self.questions()
                .replace_one(doc! { "_id": &record.id }, record)
                .with_options(upsert())
                .await
                .map_err(write_error)?;
            Ok::<_, EngineError>(())
        })
        .await
    }

    async fn upsert_progress(&self, write: &ProgressWrite) -> EngineResult<()> {
        track_store_operation("upsert_progress", async {
            let id = write.record_id();
            let at_ms = write.recorded_at.timestamp_millis();
            let document = ProgressDocument {
                id: id.clone(),
                write: write.clone(),
                recorded_at_ms: at_ms,
            };
            match self
                .progress()
                .replace_one(unless_newer(&id, "recorded_at_ms", at_ms), &document)
                .with_options(upsert())
                .await
            {
                Ok(_) => {}
                Err(err) if is_duplicate_key(&err) => {
                    debug!(record_id = %id, "Stored progress is newer, skipping stale write");
                }
                Err(err) => return Err(write_error(err)),
            }

            if let Some(chunk_id) = &write.chunk_id {
                let mastery_id = format!("{}:{}", write.user_id, chunk_id);
                let mastery = MasteryDocument {
                    id: mastery_id.clone(),
                    user_id: write.user_id.clone(),
                    chunk_id: chunk_id.clone(),
                    mastery_score: write.mastery_score,
                    updated_at: write.recorded_at,
                    updated_at_ms: at_ms,
                };
                match self
                    .mastery()
                    .replace_one(unless_newer(&mastery_id, "updated_at_ms", at_ms), &mastery)
                    .with_options(upsert())
                    .await
                {
                    Ok(_) => {}
                    Err(err) if is_duplicate_key(&err) => {
                        debug!(mastery_id = %mastery_id, "Stored chunk mastery is newer, skipping stale write");
                    }
                    Err(err) => return Err(write_error(err)),
                }
            }

            Ok::<_, EngineError>(())
        })
        .await
    }
}
