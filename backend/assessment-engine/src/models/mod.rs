use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod content;
pub mod progress;
pub mod question;

/// How a learner answered a single question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Incorrect,
    Blank,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Correct => "correct",
            Outcome::Incorrect => "incorrect",
            Outcome::Blank => "blank",
        }
    }

    pub fn is_correct(&self) -> bool {
        matches!(self, Outcome::Correct)
    }
}

/// One recorded answer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub question_id: String,
    pub outcome: Outcome,
    pub time_spent_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResponseEvent {
    pub fn new(question_id: impl Into<String>, outcome: Outcome, time_spent_ms: u64) -> Self {
        Self {
            question_id: question_id.into(),
            outcome,
            time_spent_ms,
            timestamp: Utc::now(),
        }
    }
}

/// A content chunk as seen by the exam planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: String,
    pub concept_count: u32,
    pub difficulty_index: f64,
    /// 0-100, higher means better mastered.
    pub mastery_score: f64,
}

/// Course-level weight applied on top of per-unit weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    #[default]
    Medium,
    Low,
}

/// Cognitive demand of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BloomLevel {
    Knowledge,
    Application,
    Analysis,
}

impl BloomLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BloomLevel::Knowledge => "knowledge",
            BloomLevel::Application => "application",
            BloomLevel::Analysis => "analysis",
        }
    }

    /// One tier lower; knowledge is the floor.
    pub fn step_down(self) -> Self {
        match self {
            BloomLevel::Analysis => BloomLevel::Application,
            BloomLevel::Application | BloomLevel::Knowledge => BloomLevel::Knowledge,
        }
    }
}

impl fmt::Display for BloomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool a generated question belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    Practice,
    /// Mock-exam questions; they never enter the review schedule.
    Exam,
    Archive,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::Practice => "practice",
            UsageType::Exam => "exam",
            UsageType::Archive => "archive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_level_steps_down_one_tier() {
        assert_eq!(BloomLevel::Analysis.step_down(), BloomLevel::Application);
        assert_eq!(BloomLevel::Application.step_down(), BloomLevel::Knowledge);
        assert_eq!(BloomLevel::Knowledge.step_down(), BloomLevel::Knowledge);
    }

    #[test]
    fn bloom_levels_are_ordered_by_demand() {
        assert!(BloomLevel::Knowledge < BloomLevel::Application);
        assert!(BloomLevel::Application < BloomLevel::Analysis);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::Incorrect).unwrap();
        assert_eq!(json, "\"incorrect\"");
    }
}
