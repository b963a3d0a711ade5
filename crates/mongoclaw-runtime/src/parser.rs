//! Extraction of structured data from AI responses.
//!
//! Providers rarely return clean JSON even when asked to. The parse ladder
//! tries, in order: the whole content as JSON, a fenced code block, the first
//! balanced object, the first balanced array, then a lenient repair pass for
//! trailing commas, unquoted keys and single quotes.

use mongoclaw_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::warn;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*\n?(.*?)\n?```").unwrap());
static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());
static UNQUOTED_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());

pub struct ResponseParser {
    strict: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ResponseParser {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Parse a response body, optionally validating against a JSON schema.
    ///
    /// In strict mode an unextractable body or schema mismatch fails the
    /// attempt; otherwise the raw content is wrapped and validation problems
    /// are logged.
    pub fn parse(&self, content: &str, schema: Option<&JsonValue>) -> Result<JsonValue> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::AiParse("empty response content".into()));
        }

        let Some(parsed) = extract_json(content) else {
            if self.strict {
                return Err(Error::AiParse("could not extract JSON from response".into()));
            }
            return Ok(serde_json::json!({"content": content, "_raw": true}));
        };

        if let Some(schema) = schema {
            let problems = validate_schema(&parsed, schema, "");
            if !problems.is_empty() {
                if self.strict {
                    return Err(Error::AiParse(format!(
                        "schema validation failed: {}",
                        problems.join("; ")
                    )));
                }
                warn!(problems = ?problems, "response schema validation problems");
            }
        }
        Ok(parsed)
    }
}

pub fn extract_json(content: &str) -> Option<JsonValue> {
    if let Ok(value) = serde_json::from_str(content) {
        return Some(value);
    }
    if let Some(captures) = FENCED_BLOCK.captures(content) {
        if let Ok(value) = serde_json::from_str(captures[1].trim()) {
            return Some(value);
        }
    }
    if let Some(candidate) = balanced_slice(content, '{', '}') {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Some(value);
        }
    }
    if let Some(candidate) = balanced_slice(content, '[', ']') {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Some(value);
        }
    }
    if let Some(repaired) = repair(content) {
        if let Ok(value) = serde_json::from_str(&repaired) {
            return Some(value);
        }
    }
    None
}

/// First balanced `open`…`close` span, string-aware.
fn balanced_slice(content: &str, open: char, close: char) -> Option<&str> {
    let start = content.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn repair(content: &str) -> Option<String> {
    let fixed = TRAILING_COMMA.replace_all(content, "$1");
    let fixed = UNQUOTED_KEY.replace_all(&fixed, "$1\"$2\":");
    let fixed = fixed.replace('\'', "\"");

    for (open, close) in [('{', '}'), ('[', ']')] {
        let start = fixed.find(open);
        let end = fixed.rfind(close);
        if let (Some(start), Some(end)) = (start, end) {
            if end > start {
                return Some(fixed[start..=end].to_string());
            }
        }
    }
    None
}

/// Simplified JSON-schema validation covering `type`, `properties`,
/// `required`, `items` and `enum`.
pub fn validate_schema(data: &JsonValue, schema: &JsonValue, path: &str) -> Vec<String> {
    let mut problems = Vec::new();
    let at = |field: &str| {
        if path.is_empty() {
            field.to_string()
        } else {
            format!("{path}.{field}")
        }
    };

    if let Some(expected) = schema.get("type").and_then(JsonValue::as_str) {
        if !check_type(data, expected) {
            problems.push(format!(
                "{}: expected type '{expected}'",
                if path.is_empty() { "$" } else { path }
            ));
            return problems;
        }
    }

    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(JsonValue::as_object),
        data.as_object(),
    ) {
        if let Some(required) = schema.get("required").and_then(JsonValue::as_array) {
            for field in required.iter().filter_map(JsonValue::as_str) {
                if !object.contains_key(field) {
                    problems.push(format!("missing required field '{}'", at(field)));
                }
            }
        }
        for (field, field_schema) in properties {
            if let Some(value) = object.get(field) {
                problems.extend(validate_schema(value, field_schema, &at(field)));
            }
        }
    }

    if let (Some(items_schema), Some(items)) = (schema.get("items"), data.as_array()) {
        for (index, item) in items.iter().enumerate() {
            let item_path = if path.is_empty() {
                format!("[{index}]")
            } else {
                format!("{path}[{index}]")
            };
            problems.extend(validate_schema(item, items_schema, &item_path));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(JsonValue::as_array) {
        if !allowed.contains(data) {
            problems.push(format!(
                "{}: value not in enum",
                if path.is_empty() { "$" } else { path }
            ));
        }
    }

    problems
}

fn check_type(value: &JsonValue, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
