use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::content::Guidelines;
use crate::models::question::{GeneratedQuestion, ValidationReport};
use crate::models::BloomLevel;

pub const SYSTEM_PROMPT: &str = "You are an assessment author writing multiple-choice exam questions \
from study material. Stay strictly within the supplied text, write in a formal academic register and \
answer with a single JSON object only.";

pub const VALIDATION_SYSTEM_PROMPT: &str = "You are a strict exam quality reviewer. Check the question \
against the source text for factual accuracy, a single defensible answer, plausible distractors and \
clear wording. Answer with a single JSON object only.";

pub const DEFAULT_RETRY_PROMPT: &str = "Your previous answer did not match the required JSON schema. \
Return valid JSON only, with no commentary.";

pub const REVISION_RETRY_PROMPT: &str = "Your previous answer did not match the required JSON schema. \
Return valid JSON only. Rules:\n\
1. \"o\" must contain exactly 5 options.\n\
2. \"a\" must be the index of the correct option, between 0 and 4.\n\
3. \"img\" is the referenced image index, or null when no image is used.\n\
4. \"evidence\" must quote the supporting sentence and cannot be empty.\n\
5. Add no commentary outside the JSON.";

const QUALITY_RULES: &str = "## QUALITY RULES\n\
1. Stem and options use formal exam language.\n\
2. Stay inside the text, though the idea may be tested in a new example.\n\
3. At least two distractors relate to other concepts from the text. \"All of the above\" and \"None of the above\" are forbidden.\n\
4. Always exactly five options (A-E) of similar length and structure.\n\
5. Double every backslash in LaTeX (\\\\frac, \\\\alpha).\n\
6. When a question relies on an image, mention \"[IMAGE: X]\" in the stem.";

const OUTPUT_FORMAT: &str = "## OUTPUT FORMAT\n\
Return only JSON with this shape:\n\
{\n  \"q\": \"question stem\",\n  \"o\": [\"A\", \"B\", \"C\", \"D\", \"E\"],\n  \"a\": 0,\n  \
\"exp\": \"explanation\",\n  \"evidence\": \"quote from the text\",\n  \"img\": null\n}\n\
Set \"img\" to the index of the referenced image, otherwise null.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// System, context and task blocks in a fixed order so the shared prefix can
/// be cached by the provider.
pub fn assemble(system: &str, context: &str, task: &str) -> Vec<PromptMessage> {
    vec![
        PromptMessage::system(normalize_line_endings(system)),
        PromptMessage::user(normalize_line_endings(context)),
        PromptMessage::user(format!("--- TASK ---\n{}", normalize_line_endings(task))),
    ]
}

pub fn system_prompt(prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if !prefix.trim().is_empty() => format!("{}\n{}", prefix, SYSTEM_PROMPT),
        _ => SYSTEM_PROMPT.to_string(),
    }
}

lazy_static! {
    static ref IMAGE_MARKUP: Regex = Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap();
}

/// Strips embedded markdown images; the model only sees `[IMAGE: n]` tags.
pub fn clean_reference_images(content: &str) -> String {
    let mut index = 0usize;
    IMAGE_MARKUP
        .replace_all(content, |_: &regex::Captures<'_>| {
            let tag = format!("[IMAGE: {}]", index);
            index += 1;
            tag
        })
        .into_owned()
}

/// Shared context block: course, section, guidelines, rules and the source text.
pub fn build_context(
    content: &str,
    course_name: Option<&str>,
    section_title: Option<&str>,
    guidelines: Option<&Guidelines>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(course) = course_name.filter(|c| !c.is_empty()) {
        parts.push(format!("## COURSE: {}", course));
    }
    if let Some(section) = section_title.filter(|s| !s.is_empty()) {
        parts.push(format!("## SECTION: {}", section));
    }

    if let Some(guidelines) = guidelines {
        parts.push("## COURSE GUIDELINES".to_string());
        if let Some(instruction) = &guidelines.instruction {
            parts.push(format!("### TECHNICAL RULES\n{}", instruction));
        }
        if let Some(example) = &guidelines.good_example {
            parts.push(format!("### GOOD EXAMPLE (follow this)\n{}", example));
        }
        if let Some(example) = &guidelines.bad_example {
            parts.push(format!("### BAD EXAMPLE (avoid this)\n{}", example));
        }
    }

    parts.push(QUALITY_RULES.to_string());
    parts.push(OUTPUT_FORMAT.to_string());
    parts.push("## SOURCE TEXT".to_string());
    parts.push(content.to_string());

    parts.join("\n\n")
}

fn bloom_instruction(level: BloomLevel) -> &'static str {
    match level {
        BloomLevel::Knowledge => "Test recall of a definition, fact or rule stated in the text.",
        BloomLevel::Application => "Ask the learner to apply a rule from the text to a new, concrete case.",
        BloomLevel::Analysis => "Ask the learner to compare, relate or reason about several ideas from the text.",
    }
}

fn diagnosis_block(previous_diagnoses: &[String]) -> String {
    if previous_diagnoses.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = previous_diagnoses.iter().map(|d| format!("- {}", d)).collect();
    format!(
        "\n## LEARNER'S RECENT MISTAKES\n{}\nTarget these weak spots where the text allows.",
        lines.join("\n")
    )
}

pub fn initial_task(
    concept_title: &str,
    level: BloomLevel,
    focus: Option<&str>,
    previous_diagnoses: &[String],
) -> String {
    let focus = focus
        .map(|f| format!("\nFocus: {}", f))
        .unwrap_or_default();
    format!(
        "Write one question about the concept \"{}\".{}\nCognitive level: {}. {}{}",
        concept_title,
        focus,
        level,
        bloom_instruction(level),
        diagnosis_block(previous_diagnoses)
    )
}

fn compact_question(question: &GeneratedQuestion) -> String {
    let value = serde_json::json!({
        "q": question.question,
        "o": question.options,
        "a": question.answer_index,
        "exp": question.explanation,
    });
    serde_json::to_string_pretty(&value).unwrap_or_default()
}

pub fn revision_task(rejected: &GeneratedQuestion, report: &ValidationReport) -> String {
    let faults: Vec<String> = report
        .critical_faults
        .iter()
        .map(|f| format!("- {}", f))
        .collect();
    format!(
        "The question below was REJECTED for the listed reasons. Revise it using the feedback.\n\n\
         ## REJECTED QUESTION\n{}\n\n## CRITICAL FAULTS\n{}\n\n## SUGGESTED IMPROVEMENT\n{}\n\n\
         Fix every fault and keep the academic tone.\n{}",
        compact_question(rejected),
        faults.join("\n"),
        report.improvement_suggestion,
        REVISION_RETRY_PROMPT
    )
}

pub struct FollowUpPrompt<'a> {
    pub evidence: &'a str,
    pub original: &'a GeneratedQuestion,
    pub incorrect_option: u8,
    pub correct_option: u8,
    pub target_level: BloomLevel,
    pub scaffolding_note: Option<&'a str>,
    pub previous_diagnoses: &'a [String],
}

pub fn follow_up_task(prompt: &FollowUpPrompt<'_>) -> String {
    let chosen = prompt
        .original
        .options
        .get(usize::from(prompt.incorrect_option))
        .map(String::as_str)
        .unwrap_or("");
    let correct = prompt
        .original
        .options
        .get(usize::from(prompt.correct_option))
        .map(String::as_str)
        .unwrap_or("");

    format!(
        "The learner answered this question incorrectly.\n\n## ORIGINAL QUESTION\n{}\n\n\
         Chosen option ({}): {}\nCorrect option ({}): {}\nSupporting evidence: {}\n\n\
         Write a new question on the same idea that exposes the misconception behind the chosen option.\n\
         Cognitive level: {}. {}{}{}\n\
         Also fill \"diagnosis\" with a one-sentence description of the learner's mistake and \
         \"insight\" with a short hint that corrects it.",
        compact_question(prompt.original),
        prompt.incorrect_option,
        chosen,
        prompt.correct_option,
        correct,
        prompt.evidence,
        prompt.target_level,
        bloom_instruction(prompt.target_level),
        prompt
            .scaffolding_note
            .map(|n| format!("\n{}", n))
            .unwrap_or_default(),
        diagnosis_block(prompt.previous_diagnoses)
    )
}

pub fn validation_context(source: &str) -> String {
    format!("## SOURCE TEXT\n{}", source)
}

pub fn validation_task(question: &GeneratedQuestion) -> String {
    format!(
        "## QUESTION UNDER REVIEW\n{}\nEvidence: {}\n\n\
         Score the question from 0 to 100 and decide APPROVED or REJECTED. Return JSON:\n\
         {{\"total_score\": 0, \"decision\": \"APPROVED\", \"critical_faults\": [], \"improvement_suggestion\": \"\"}}",
        compact_question(question),
        question.evidence
    )
}
