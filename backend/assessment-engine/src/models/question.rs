use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use validator::Validate;

use super::{BloomLevel, UsageType};

/// Multiple-choice question as produced by the generation service.
///
/// Wire keys follow the compact shape the model is prompted with
/// (`q`, `o`, `a`, `exp`, `img`); long names are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GeneratedQuestion {
    #[serde(rename = "q", alias = "question")]
    #[validate(length(min = 10, message = "question text is too short"))]
    pub question: String,

    #[serde(rename = "o", alias = "options")]
    #[validate(length(equal = 5, message = "exactly five options are required"))]
    pub options: Vec<String>,

    #[serde(rename = "a", alias = "answer")]
    #[validate(range(max = 4, message = "answer index must be between 0 and 4"))]
    pub answer_index: u8,

    #[serde(rename = "exp", alias = "explanation")]
    #[validate(length(min = 10, message = "explanation is too short"))]
    pub explanation: String,

    #[validate(length(min = 1, message = "evidence sentence is required"))]
    pub evidence: String,

    #[serde(
        rename = "img",
        default,
        deserialize_with = "lenient_image_index",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_index: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 500))]
    pub diagnosis: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 500))]
    pub insight: Option<String>,

    #[serde(rename = "bloomLevel", default, skip_serializing_if = "Option::is_none")]
    pub bloom_level: Option<BloomLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
}

/// Models emit the image reference as a number, a numeric string, `"null"` or
/// nothing at all.
fn lenient_image_index<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                None
            } else {
                trimmed.parse::<u32>().ok()
            }
        }
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationDecision {
    Approved,
    Rejected,
}

impl ValidationDecision {
    /// Maps free-text verdicts onto the two decisions.
    pub fn normalize(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.contains("REJECT") || upper.contains("FAIL") || upper.contains("DENIED") {
            Some(ValidationDecision::Rejected)
        } else if upper.contains("APPROV")
            || upper.contains("ACCEPT")
            || upper.contains("PASS")
            || upper == "OK"
            || upper == "TRUE"
        {
            Some(ValidationDecision::Approved)
        } else {
            None
        }
    }
}

fn lenient_decision<'de, D>(deserializer: D) -> Result<ValidationDecision, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    ValidationDecision::normalize(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized decision: {}", raw)))
}

fn lenient_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("score is not a finite number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("score is not numeric: {}", s))),
        other => Err(serde::de::Error::custom(format!(
            "unexpected score value: {}",
            other
        ))),
    }
}

/// Verdict of the quality validator on one generated question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ValidationReport {
    #[serde(
        alias = "score",
        alias = "point",
        deserialize_with = "lenient_score"
    )]
    #[validate(range(min = 0.0, max = 100.0))]
    pub total_score: f64,

    #[serde(deserialize_with = "lenient_decision")]
    pub decision: ValidationDecision,

    #[serde(default)]
    pub critical_faults: Vec<String>,

    #[serde(default)]
    pub improvement_suggestion: String,
}

impl ValidationReport {
    pub fn is_approved(&self) -> bool {
        self.decision == ValidationDecision::Approved
    }
}

/// A question persisted in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub chunk_id: String,
    pub usage_type: UsageType,
    pub bloom_level: BloomLevel,
    pub concept_title: String,
    pub question_data: GeneratedQuestion,
    /// Learner a follow-up question was written for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_for: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_payload() -> Value {
        json!({
            "q": "Which organ pumps blood through the body?",
            "o": ["Heart", "Lung", "Liver", "Kidney", "Skin"],
            "a": 0,
            "exp": "The heart is the muscular pump of the circulatory system.",
            "evidence": "The heart pumps blood.",
            "img": "null"
        })
    }

    #[test]
    fn parses_compact_keys_and_null_image() {
        let question: GeneratedQuestion = serde_json::from_value(valid_payload()).unwrap();
        assert_eq!(question.options.len(), 5);
        assert_eq!(question.image_index, None);
        assert!(question.validate().is_ok());
    }

    #[test]
    fn numeric_image_string_is_parsed() {
        let mut payload = valid_payload();
        payload["img"] = json!("3");
        let question: GeneratedQuestion = serde_json::from_value(payload).unwrap();
        assert_eq!(question.image_index, Some(3));
    }

    #[test]
    fn four_options_fail_validation() {
        let mut payload = valid_payload();
        payload["o"] = json!(["A", "B", "C", "D"]);
        let question: GeneratedQuestion = serde_json::from_value(payload).unwrap();
        assert!(question.validate().is_err());
    }

    #[test]
    fn answer_index_out_of_range_fails_validation() {
        let mut payload = valid_payload();
        payload["a"] = json!(7);
        let question: GeneratedQuestion = serde_json::from_value(payload).unwrap();
        assert!(question.validate().is_err());
    }

    #[test]
    fn decision_normalization() {
        assert_eq!(
            ValidationDecision::normalize("approved with notes"),
            Some(ValidationDecision::Approved)
        );
        assert_eq!(
            ValidationDecision::normalize("REJECTED"),
            Some(ValidationDecision::Rejected)
        );
        assert_eq!(ValidationDecision::normalize("maybe"), None);
    }

    #[test]
    fn validation_report_accepts_score_alias_and_string_score() {
        let report: ValidationReport = serde_json::from_value(json!({
            "score": "72",
            "decision": "Rejected",
            "critical_faults": ["distractor B is also correct"]
        }))
        .unwrap();

        assert_eq!(report.total_score, 72.0);
        assert!(!report.is_approved());
        assert_eq!(report.critical_faults.len(), 1);
        assert!(report.improvement_suggestion.is_empty());
    }
}
