use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Outcome;

/// Spaced-repetition state of a question for one learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShelfStatus {
    #[default]
    Active,
    PendingFollowup,
    Archived,
}

impl ShelfStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShelfStatus::Active => "active",
            ShelfStatus::PendingFollowup => "pending_followup",
            ShelfStatus::Archived => "archived",
        }
    }
}

/// Stored per-learner status of one question.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuestionStatus {
    pub user_id: String,
    pub question_id: String,
    #[serde(default)]
    pub status: ShelfStatus,
    #[serde(default)]
    pub consecutive_success: f64,
    #[serde(default)]
    pub consecutive_fails: u32,
    #[serde(default)]
    pub next_review_session: Option<u32>,
}

/// Outcome of scoring one submitted answer against stored progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub is_correct: bool,
    pub score_delta: i32,
    pub new_mastery: u32,
    pub new_status: ShelfStatus,
    pub next_review_session: Option<u32>,
    pub is_topic_refreshed: bool,
    pub new_success_count: f64,
    pub new_fails_count: u32,
}

/// Idempotent progress upsert, keyed by `user_id` + `question_id`.
///
/// This is the payload carried through the offline queue; see
/// [`ProgressWrite::queue_payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressWrite {
    pub user_id: String,
    pub question_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub session_number: u32,
    pub outcome: Outcome,
    pub time_spent_ms: u64,
    pub status: ShelfStatus,
    pub consecutive_success: f64,
    pub consecutive_fails: u32,
    #[serde(default)]
    pub next_review_session: Option<u32>,
    pub mastery_score: u32,
    pub recorded_at: DateTime<Utc>,
}

impl ProgressWrite {
    /// Stable document id used for upserts.
    pub fn record_id(&self) -> String {
        format!("{}:{}", self.user_id, self.question_id)
    }

    /// JSON form queued when the store is unreachable. Carries `record_id`
    /// so writes from different learners on one question stay apart.
    pub fn queue_payload(&self) -> Result<Value, serde_json::Error> {
        let mut payload = serde_json::to_value(self)?;
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("record_id".to_string(), Value::String(self.record_id()));
        }
        Ok(payload)
    }
}

/// A pending write held by the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub id: String,
    pub payload: Value,
    /// Epoch milliseconds at enqueue time.
    #[serde(rename = "timestamp")]
    pub enqueued_at: i64,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
}

/// Per-entry report returned by a queue flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entry hit the retry ceiling and was discarded.
    #[serde(default)]
    pub dropped: bool,
}
