//! Helpers for loosely-typed model payloads and bounded text summaries.

use serde_json::{Map, Value};

/// Model response content: a JSON object when one could be produced, else raw text.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Object(Map<String, Value>),
    Text(String),
}

impl ResponseData {
    /// Render for transcripts and artifacts.
    pub fn render(&self) -> String {
        match self {
            ResponseData::Object(map) => serde_json::to_string_pretty(map)
                .unwrap_or_else(|_| Value::Object(map.clone()).to_string()),
            ResponseData::Text(text) => text.clone(),
        }
    }

    /// Object form, parsing text when it embeds a JSON object.
    pub fn to_object(&self) -> Option<Map<String, Value>> {
        match self {
            ResponseData::Object(map) => Some(map.clone()),
            ResponseData::Text(text) => extract_json_object(text),
        }
    }
}

/// Parse `text` as a JSON object, falling back to the span between the first
/// `{` and the last `}`.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(map);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Clip `text` to at most `limit` characters, marking the cut with `...`.
pub fn summarize_text(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    if limit <= 3 {
        return trimmed.chars().take(limit).collect();
    }
    let mut clipped: String = trimmed.chars().take(limit - 3).collect();
    clipped.push_str("...");
    clipped
}

/// First non-empty string value among `keys`.
pub fn first_text_field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| {
        map.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

/// Join a list for human-readable records, `none` when empty.
pub fn join_or_none<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        return "none".to_string();
    }
    items
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ")
}
