//! Response repair
//!
//! Reasoning models are instructed to emit bare JSON but routinely wrap
//! it in code fences or commentary. Parsing goes strict first, then one
//! repair pass: strip fences, fall back to the first balanced
//! brace-delimited substring, and re-parse exactly once.

use once_cell::sync::Lazy;
use regex::Regex;

use super::client::TriageError;
use super::LlmAnalysis;

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence regex"));

/// Parse a raw reasoning response into a structured verdict.
pub fn parse_analysis(raw: &str) -> Result<LlmAnalysis, TriageError> {
    if let Ok(parsed) = serde_json::from_str::<LlmAnalysis>(raw.trim()) {
        return Ok(parsed);
    }

    let candidate = FENCE_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| extract_braced(raw))
        .ok_or_else(|| TriageError::Parse("no JSON object in response".to_string()))?;

    serde_json::from_str::<LlmAnalysis>(candidate.trim())
        .map_err(|e| TriageError::Parse(e.to_string()))
}

/// First balanced brace-delimited substring, string-literal aware.
fn extract_braced(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
