//! Response scoring: running tallies, percentage and mastery derivation.

use serde::{Deserialize, Serialize};

use crate::models::Outcome;

const INCORRECT_CREDIT: f64 = 0.2;
const COVERAGE_WEIGHT: f64 = 0.4;
const AVERAGE_SCORE_WEIGHT: f64 = 0.6;

/// Running tally of a quiz session. Updates produce a new value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultAccumulator {
    pub correct: u32,
    pub incorrect: u32,
    pub blank: u32,
    pub total_time_ms: u64,
}

impl ResultAccumulator {
    pub fn total(&self) -> u32 {
        self.correct + self.incorrect + self.blank
    }

    /// Returns a new accumulator with `outcome` counted. Negative or
    /// non-finite elapsed times count as zero.
    #[must_use]
    pub fn apply(self, outcome: Outcome, elapsed_ms: f64) -> Self {
        let elapsed = if elapsed_ms.is_finite() && elapsed_ms > 0.0 {
            elapsed_ms.round() as u64
        } else {
            0
        };

        let mut next = self;
        match outcome {
            Outcome::Correct => next.correct += 1,
            Outcome::Incorrect => next.incorrect += 1,
            Outcome::Blank => next.blank += 1,
        }
        next.total_time_ms = next.total_time_ms.saturating_add(elapsed);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedResults {
    pub percentage: u32,
    pub mastery_score: u32,
}

/// End-of-session summary shown to the learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultSummary {
    pub percentage: u32,
    pub mastery_score: u32,
    pub pending_review: u32,
    pub total_time_formatted: String,
}

pub fn apply_response(
    accumulator: ResultAccumulator,
    outcome: Outcome,
    elapsed_ms: f64,
) -> ResultAccumulator {
    accumulator.apply(outcome, elapsed_ms)
}

pub fn derive_results(accumulator: &ResultAccumulator) -> DerivedResults {
    let total = accumulator.total();
    if total == 0 {
        return DerivedResults {
            percentage: 0,
            mastery_score: 0,
        };
    }

    let total = f64::from(total);
    let correct = f64::from(accumulator.correct);
    let incorrect = f64::from(accumulator.incorrect);

    DerivedResults {
        percentage: (100.0 * correct / total).round() as u32,
        mastery_score: (100.0 * (correct + INCORRECT_CREDIT * incorrect) / total).round() as u32,
    }
}

pub fn summarize(accumulator: &ResultAccumulator) -> TestResultSummary {
    let derived = derive_results(accumulator);

    TestResultSummary {
        percentage: derived.percentage,
        mastery_score: derived.mastery_score,
        pending_review: accumulator.incorrect + accumulator.blank,
        total_time_formatted: format_duration(accumulator.total_time_ms),
    }
}

fn format_duration(total_ms: u64) -> String {
    let seconds = total_ms / 1000;
    let hours = seconds / 3600;
    let minutes = (seconds / 60) % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds % 60)
}

/// Chunk-level mastery: 40 points for coverage of the chunk's question pool,
/// 60% of the average score on top.
pub fn calculate_chunk_mastery(total_questions: u32, unique_solved: u32, average_score: f64) -> u32 {
    if total_questions == 0 {
        return 0;
    }

    let coverage = (f64::from(unique_solved) / f64::from(total_questions)).min(1.0);
    let average = if average_score.is_finite() {
        average_score.max(0.0)
    } else {
        0.0
    };

    (coverage * COVERAGE_WEIGHT * 100.0 + average * AVERAGE_SCORE_WEIGHT).round() as u32
}
