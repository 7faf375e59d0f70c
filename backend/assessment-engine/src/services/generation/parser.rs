use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?is)<think>.*?</think>").unwrap();
    static ref OPEN_THINK: Regex = Regex::new(r"(?is)<think>.*").unwrap();
    static ref FENCED: Regex = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap();
    static ref BACKSLASH: Regex = Regex::new(r#"(\\["\\/nrt]|\\u[0-9a-fA-F]{4})|(\\)"#).unwrap();
}

/// Closers tried in turn when the model's output was cut off mid-object.
const TRUNCATION_CLOSERS: [&str; 8] = ["}", "]", "\"}", "\"]", "}]", "]}", "}}", "\"}]}"];

/// Pulls the outermost JSON object or array out of free-form model output.
///
/// Reasoning blocks and markdown fences are removed, stray LaTeX backslashes
/// are escaped, and truncated output is closed on a best-effort basis.
pub fn extract_json(text: &str) -> Option<Value> {
    let without_think = THINK_BLOCK.replace_all(text.trim(), "");
    let without_think = OPEN_THINK.replace_all(&without_think, "");
    let mut clean = without_think.trim().to_string();

    if let Some(inner) = FENCED.captures(&clean).and_then(|c| c.get(1)) {
        clean = inner.as_str().trim().to_string();
    }

    let start = match (clean.find('{'), clean.find('[')) {
        (Some(object), Some(array)) => object.min(array),
        (Some(object), None) => object,
        (None, Some(array)) => array,
        (None, None) => return None,
    };
    let closer = if clean[start..].starts_with('{') { '}' } else { ']' };

    let slice = match clean.rfind(closer) {
        Some(end) if end > start => &clean[start..=end],
        _ => &clean[start..],
    };

    let escaped = BACKSLASH.replace_all(slice, |caps: &Captures<'_>| {
        if let Some(valid) = caps.get(1) {
            valid.as_str().to_string()
        } else {
            "\\\\".to_string()
        }
    });

    if let Ok(value) = serde_json::from_str::<Value>(&escaped) {
        return Some(value);
    }

    TRUNCATION_CLOSERS
        .iter()
        .find_map(|closer| serde_json::from_str::<Value>(&format!("{}{}", escaped, closer)).ok())
}
