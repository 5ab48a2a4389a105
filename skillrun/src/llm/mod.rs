//! Model provider abstraction.
//!
//! The scheduler talks to models only through [`ModelProvider`]. The HTTP
//! clients live in [`anthropic`] and [`gemini`]; [`router::ProviderRouter`]
//! dispatches between them.

pub mod anthropic;
pub mod gemini;
pub mod router;

use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::payload::ResponseData;
use crate::core::retry::{ErrorClass, is_retryable};
use crate::core::types::ActionType;
use crate::io::config::Provider;

/// Name of the native structured-output tool carrying a decision.
pub const DECISION_TOOL_NAME: &str = "agent_decision";

/// A tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The `agent_decision` tool used by native structured output modes.
pub fn decision_tool() -> ToolSpec {
    let action_types: Vec<&str> = ActionType::ALL.iter().map(|kind| kind.as_str()).collect();
    ToolSpec {
        name: DECISION_TOOL_NAME.to_string(),
        description: "Report the next decision: selected skill, reasoning and planned actions."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "selected_skill": {"type": ["string", "null"]},
                "reasoning_summary": {"type": "string"},
                "required_disclosure_paths": {"type": "array", "items": {"type": "string"}},
                "planned_actions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": action_types},
                            "params": {"type": "object"},
                            "expected_output": {"type": ["string", "null"]}
                        },
                        "required": ["type", "params"]
                    }
                }
            },
            "required": ["reasoning_summary", "planned_actions"]
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionRequest<'a> {
    pub provider: Provider,
    pub prompt: &'a str,
    pub model: &'a str,
    pub max_tokens: u32,
    /// 1-based attempt number within the retry loop.
    pub attempt: u32,
    pub tools: &'a [ToolSpec],
    pub force_tool_use: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub data: ResponseData,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("provider {0} is not configured")]
    NotConfigured(&'static str),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Status { status, .. } => ErrorClass::Status(*status),
            ProviderError::Timeout(_) | ProviderError::Connection(_) => ErrorClass::Transport,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable(self.class())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ProviderError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ProviderError::Connection(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Other(err.to_string())
        }
    }
}

/// Synchronous model backend.
pub trait ModelProvider {
    fn is_configured(&self, provider: Provider) -> bool;

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError>;
}

/// Provider-shaped summary of a request, written to transcripts and artifacts.
pub fn raw_request_summary(request: &CompletionRequest<'_>) -> Value {
    let tool_names: Vec<&str> = request.tools.iter().map(|tool| tool.name.as_str()).collect();
    match request.provider {
        Provider::Anthropic => {
            let mut summary = json!({
                "attempt": request.attempt,
                "model": request.model,
                "max_tokens": request.max_tokens,
                "messages": [{"role": "user", "content": request.prompt}],
            });
            if let (Some(obj), Some(first)) = (summary.as_object_mut(), tool_names.first()) {
                obj.insert("tools".to_string(), json!(tool_names));
                let choice = if request.force_tool_use {
                    json!({"type": "tool", "name": first})
                } else {
                    json!({"type": "auto"})
                };
                obj.insert("tool_choice".to_string(), choice);
            }
            summary
        }
        Provider::Gemini => {
            let mut config = Map::new();
            config.insert("max_output_tokens".to_string(), json!(request.max_tokens));
            if tool_names.is_empty() {
                config.insert("response_mime_type".to_string(), json!("application/json"));
            } else {
                let mode = if request.force_tool_use { "ANY" } else { "AUTO" };
                config.insert("tools".to_string(), json!(tool_names));
                config.insert(
                    "tool_config".to_string(),
                    json!({"function_calling_mode": mode}),
                );
            }
            json!({
                "attempt": request.attempt,
                "model": request.model,
                "contents": request.prompt,
                "config": config,
            })
        }
    }
}

/// Text content becomes a JSON object when it parses as one, else stays text.
pub(crate) fn response_from_text(text: &str) -> ResponseData {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ResponseData::Object(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => ResponseData::Object(map),
        _ => ResponseData::Text(trimmed.to_string()),
    }
}
