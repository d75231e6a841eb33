//! Pulls a single JSON object out of free-form model output.
//!
//! Models wrap their answer in commentary or markdown fences often enough that
//! the raw text cannot be handed to `serde_json` directly. Extraction never
//! guesses: zero candidates or several different candidates are both reported
//! as malformed.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Parsed(Map<String, Value>),
    Malformed(String),
}

pub fn extract_json_object(text: &str) -> Extraction {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Extraction::Malformed("model returned an empty response".to_string());
    }

    // Whole response is already JSON
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Object(map) => Extraction::Parsed(map),
            other => Extraction::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )),
        };
    }

    let fenced = fenced_blocks(trimmed);
    let search_space: Vec<&str> = if fenced.is_empty() { vec![trimmed] } else { fenced };

    let mut candidates: Vec<Map<String, Value>> = Vec::new();
    for segment in search_space {
        for object in balanced_objects(segment) {
            if !candidates.contains(&object) {
                candidates.push(object);
            }
        }
    }

    match candidates.len() {
        0 => Extraction::Malformed("no JSON object found in model response".to_string()),
        1 => Extraction::Parsed(candidates.remove(0)),
        n => Extraction::Malformed(format!(
            "model response contains {n} different JSON objects"
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Contents of every ``` fenced block, with any language tag stripped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        // A tag like `json` must be a single word; otherwise the fence is inline
        let tag = after_open[..body_start].trim();
        let body_start = if tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            body_start
        } else {
            0
        };
        let body = &after_open[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(body[..close].trim());
                rest = &body[close + 3..];
            }
            None => break,
        }
    }

    blocks
}

/// Top-level `{...}` spans that parse as JSON objects, in order of appearance.
fn balanced_objects(text: &str) -> Vec<Map<String, Value>> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        let candidate = &text[begin..=index];
                        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                            objects.push(map);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    objects
}
