//! Structured-payload extraction from noisy model output.
//!
//! Chat models are asked for bare JSON but routinely wrap it in markdown
//! fences, prepend prose, or leave trailing commas. [`extract_json`] tries,
//! in order:
//!
//! 1. The trimmed text as-is.
//! 2. The slice from the first `{` to the last `}` of the whole text.
//! 3. The same slice taken from the body of the first fenced block
//!    (```` ```json ```` or ```` ``` ````).
//! 4. Steps 2–3 again with trailing commas removed.
//!
//! The whole-text slice goes first because whole-file patches often carry
//! markdown (and therefore fences) inside JSON strings.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no JSON object found in response")]
    NoPayload,
    #[error("invalid JSON payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Extract the JSON object embedded in `raw`.
pub fn extract_json(raw: &str) -> Result<Value, ExtractError> {
    let trimmed = raw.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let mut candidates: Vec<String> = Vec::new();
    if let Some(slice) = brace_slice(trimmed) {
        candidates.push(slice.to_string());
    }
    if let Some(body) = fenced_body(trimmed) {
        if let Some(slice) = brace_slice(body) {
            candidates.push(slice.to_string());
        }
    }

    if candidates.is_empty() {
        return Err(ExtractError::NoPayload);
    }

    let mut first_err = None;
    for candidate in candidates
        .iter()
        .cloned()
        .chain(candidates.iter().map(|c| strip_trailing_commas(c)))
    {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value @ Value::Object(_)) => return Ok(value),
            Ok(_) => {}
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }

    Err(first_err.map(ExtractError::Invalid).unwrap_or(ExtractError::NoPayload))
}

/// Extract and deserialize the embedded payload into `T`.
pub fn parse_payload<T: DeserializeOwned>(raw: &str) -> Result<T, ExtractError> {
    let value = extract_json(raw)?;
    Ok(serde_json::from_value(value)?)
}

/// Body of the first fenced code block, language tag removed.
fn fenced_body(s: &str) -> Option<&str> {
    let open = s.find("```")?;
    let after = &s[open + 3..];
    // Skip the info string (e.g. `json`) up to the end of the line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let close = body.find("```").unwrap_or(body.len());
    Some(body[..close].trim())
}

/// Slice from the first `{` to the last `}`, inclusive.
fn brace_slice(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end > start {
        Some(&s[start..=end])
    } else {
        None
    }
}

/// Remove commas that directly precede `}` or `]` outside string literals.
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut result = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;

    for (i, &c) in chars.iter().enumerate() {
        if escape {
            escape = false;
            result.push(c);
            continue;
        }
        if in_string {
            match c {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            result.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(c);
    }

    result
}
