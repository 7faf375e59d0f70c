//! Shelf-based spaced repetition: status transitions, review scheduling and
//! per-answer mastery changes.

use crate::models::progress::{QuestionStatus, ShelfStatus, SubmissionResult};
use crate::models::{BloomLevel, Outcome, UsageType};

const POINTS_CORRECT: i32 = 10;
const PENALTY_INCORRECT_FIRST: i32 = 5;
const PENALTY_BLANK_FIRST: i32 = 2;
const PENALTY_REPEATED: i32 = 10;

const FAST_SUCCESS_INCREMENT: f64 = 1.0;
const SLOW_SUCCESS_INCREMENT: f64 = 0.5;
const ARCHIVE_THRESHOLD: f64 = 3.0;

const SESSION_GAPS: [u32; 5] = [1, 2, 5, 10, 20];

const READING_CHARS_PER_MINUTE: f64 = 780.0;
const BASE_THINKING_SECS: f64 = 15.0;
const SECS_PER_CONCEPT: f64 = 2.0;
const BUFFER_SECS: f64 = 10.0;
const DEFAULT_CONCEPT_COUNT: u32 = 5;
const TOPIC_REFRESH_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShelfTransition {
    pub status: ShelfStatus,
    pub success_count: f64,
}

/// Three fast correct answers (or six slow ones) archive a question; any
/// miss resets the chain.
pub fn calculate_shelf_status(consecutive_success: f64, is_correct: bool, is_fast: bool) -> ShelfTransition {
    if !is_correct {
        return ShelfTransition {
            status: ShelfStatus::PendingFollowup,
            success_count: 0.0,
        };
    }

    let increment = if is_fast {
        FAST_SUCCESS_INCREMENT
    } else {
        SLOW_SUCCESS_INCREMENT
    };
    let success_count = consecutive_success.max(0.0) + increment;

    let status = if success_count >= ARCHIVE_THRESHOLD {
        ShelfStatus::Archived
    } else if success_count >= SLOW_SUCCESS_INCREMENT {
        ShelfStatus::PendingFollowup
    } else {
        ShelfStatus::Active
    };

    ShelfTransition {
        status,
        success_count,
    }
}

/// Session number at which the question comes back. Always at least one
/// session ahead.
pub fn calculate_next_review_session(current_session: u32, success_count: f64) -> u32 {
    let adjusted = if success_count.is_finite() {
        success_count.max(1.0)
    } else {
        1.0
    };
    let index = (adjusted.floor() as usize)
        .saturating_sub(1)
        .min(SESSION_GAPS.len() - 1);

    current_session.saturating_add(SESSION_GAPS[index])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreChange {
    pub delta: i32,
    pub new_score: u32,
}

pub fn calculate_score_change(outcome: Outcome, current_score: u32, is_repeated: bool) -> ScoreChange {
    let delta = match (outcome, is_repeated) {
        (Outcome::Correct, _) => POINTS_CORRECT,
        (_, true) => -PENALTY_REPEATED,
        (Outcome::Incorrect, false) => -PENALTY_INCORRECT_FIRST,
        (Outcome::Blank, false) => -PENALTY_BLANK_FIRST,
    };

    let new_score = (i64::from(current_score) + i64::from(delta)).clamp(0, 100) as u32;
    ScoreChange { delta, new_score }
}

fn difficulty_multiplier(level: BloomLevel) -> f64 {
    match level {
        BloomLevel::Knowledge => 1.0,
        BloomLevel::Application => 1.2,
        BloomLevel::Analysis => 1.5,
    }
}

/// Time budget in milliseconds under which an answer counts as fast.
pub fn calculate_t_max(char_count: usize, concept_count: u32, level: BloomLevel) -> u64 {
    let reading_secs = (char_count as f64 / READING_CHARS_PER_MINUTE) * 60.0;
    let complexity_secs =
        (BASE_THINKING_SECS + f64::from(concept_count) * SECS_PER_CONCEPT) * difficulty_multiplier(level);

    ((reading_secs + complexity_secs + BUFFER_SECS) * 1000.0).round() as u64
}

/// Everything `calculate_submission_result` needs about one answer.
#[derive(Debug, Clone)]
pub struct SubmissionInput<'a> {
    pub current: Option<&'a QuestionStatus>,
    pub outcome: Outcome,
    pub time_spent_ms: u64,
    pub usage_type: UsageType,
    pub bloom_level: BloomLevel,
    /// Character length of the chunk text the question was drawn from.
    pub chunk_content_len: usize,
    pub concept_count: Option<u32>,
    pub current_mastery: u32,
    pub unique_solved: u32,
    pub total_chunk_questions: u32,
    pub session_number: u32,
}

pub fn calculate_submission_result(input: &SubmissionInput<'_>) -> SubmissionResult {
    let is_correct = input.outcome.is_correct();
    let previous_success = input.current.map(|s| s.consecutive_success).unwrap_or(0.0);
    let previous_fails = input.current.map(|s| s.consecutive_fails).unwrap_or(0);

    // Mock-exam answers leave the learner's review state alone.
    if input.usage_type == UsageType::Exam {
        return SubmissionResult {
            is_correct,
            score_delta: 0,
            new_mastery: input.current_mastery,
            new_status: ShelfStatus::Active,
            next_review_session: None,
            is_topic_refreshed: false,
            new_success_count: previous_success,
            new_fails_count: previous_fails,
        };
    }

    let is_repeated = previous_fails > 0 || previous_success > 0.0;

    let concept_count = input.concept_count.unwrap_or(DEFAULT_CONCEPT_COUNT);
    let t_max = calculate_t_max(input.chunk_content_len, concept_count, input.bloom_level);
    let is_fast = input.time_spent_ms <= t_max;

    let transition = calculate_shelf_status(previous_success, is_correct, is_fast);
    let next_review_session = match transition.status {
        ShelfStatus::PendingFollowup | ShelfStatus::Archived => Some(calculate_next_review_session(
            input.session_number,
            transition.success_count,
        )),
        ShelfStatus::Active => None,
    };

    let change = calculate_score_change(input.outcome, input.current_mastery, is_repeated);
    let score_delta = change.new_score as i32 - input.current_mastery.min(100) as i32;

    let is_topic_refreshed = input.total_chunk_questions > 0
        && f64::from(input.unique_solved) / f64::from(input.total_chunk_questions) >= TOPIC_REFRESH_RATIO;

    SubmissionResult {
        is_correct,
        score_delta,
        new_mastery: change.new_score,
        new_status: transition.status,
        next_review_session,
        is_topic_refreshed,
        new_success_count: transition.success_count,
        new_fails_count: if is_correct { 0 } else { previous_fails + 1 },
    }
}
