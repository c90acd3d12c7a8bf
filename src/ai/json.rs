//! JSON extraction from model output
//!
//! Models wrap JSON in code fences, prefix it with prose, or leave trailing
//! commas. This recovers the object or fails with a parse-classified error.

use serde_json::Value;
use tracing::debug;

use crate::types::{Result, RulectlError};

/// Parse the JSON payload of a model response
pub fn extract_json_from_response(content: &str) -> Result<Value> {
    let cleaned = strip_code_fences(content.trim().trim_start_matches('\u{feff}'));

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Ok(value);
    }

    debug!("Direct JSON parse failed, extracting embedded object");
    if let Some(embedded) = embedded_object(cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(embedded) {
            return Ok(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&strip_trailing_commas(embedded)) {
            return Ok(value);
        }
    }

    Err(RulectlError::LlmApi(format!(
        "Failed to parse JSON from response. Content preview: {}...",
        cleaned.chars().take(200).collect::<String>()
    )))
}

fn strip_code_fences(s: &str) -> &str {
    let mut result = s;
    if result.starts_with("```")
        && let Some(first_newline) = result.find('\n')
    {
        result = &result[first_newline + 1..];
    }
    if let Some(stripped) = result.trim_end().strip_suffix("```") {
        result = stripped;
    }
    result.trim()
}

/// Slice from the first `{` to the last `}`
fn embedded_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut result = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;

    for (i, &ch) in chars.iter().enumerate() {
        if escape {
            escape = false;
            result.push(ch);
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some(']') | Some('}')) {
                    continue;
                }
            }
            _ => {}
        }
        result.push(ch);
    }
    result
}
