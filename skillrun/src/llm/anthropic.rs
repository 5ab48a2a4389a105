//! Anthropic Messages API client (blocking).

use std::time::Instant;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::core::payload::ResponseData;
use crate::llm::{Completion, CompletionRequest, ProviderError, Usage, response_from_text};

const BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Credential sent with each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnthropicAuth {
    ApiKey(String),
    /// Bearer token, used when no API key is configured.
    AuthToken(String),
}

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: Client,
    auth: AnthropicAuth,
}

impl AnthropicClient {
    pub fn new(http: Client, auth: AnthropicAuth) -> Self {
        Self {
            http,
            auth,
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        match &self.auth {
            AnthropicAuth::ApiKey(key) => {
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert("x-api-key", value);
                }
            }
            AnthropicAuth::AuthToken(token) => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
        headers
    }

    pub fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        debug!(model = request.model, attempt = request.attempt, "anthropic request");
        let response = self
            .http
            .post(format!("{BASE_URL}/messages"))
            .headers(self.headers())
            .json(&build_request_body(request))
            .send()?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }
        let body: MessagesResponse = response.json()?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(Completion {
            usage: Usage {
                input_tokens: body.usage.as_ref().and_then(|u| u.input_tokens),
                output_tokens: body.usage.as_ref().and_then(|u| u.output_tokens),
                latency_ms: Some(latency_ms),
            },
            data: parse_content(body.content),
        })
    }
}

pub(crate) fn build_request_body(request: &CompletionRequest<'_>) -> Value {
    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "messages": [{"role": "user", "content": request.prompt}],
    });
    if let (Some(obj), Some(first)) = (body.as_object_mut(), request.tools.first()) {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        obj.insert("tools".to_string(), Value::Array(tools));
        let choice = if request.force_tool_use {
            json!({"type": "tool", "name": first.name})
        } else {
            json!({"type": "auto"})
        };
        obj.insert("tool_choice".to_string(), choice);
    }
    body
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

/// A tool-use block wins; otherwise the joined text is parsed.
fn parse_content(blocks: Vec<ContentBlock>) -> ResponseData {
    let mut texts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::ToolUse {
                input: Value::Object(map),
            } => return ResponseData::Object(map),
            ContentBlock::Text { text } if !text.trim().is_empty() => texts.push(text),
            _ => {}
        }
    }
    response_from_text(&texts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::Provider;
    use crate::llm::decision_tool;

    fn parse(raw: Value) -> ResponseData {
        let body: MessagesResponse = serde_json::from_value(raw).expect("response");
        parse_content(body.content)
    }

    #[test]
    fn tool_use_block_becomes_object() {
        let data = parse(json!({
            "content": [
                {"type": "text", "text": "thinking out loud"},
                {"type": "tool_use", "id": "t1", "name": "agent_decision",
                 "input": {"reasoning_summary": "r", "planned_actions": []}}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }));
        let ResponseData::Object(map) = data else {
            panic!("expected object");
        };
        assert_eq!(map["reasoning_summary"], json!("r"));
    }

    #[test]
    fn text_blocks_are_parsed_as_json_when_possible() {
        let data = parse(json!({
            "content": [{"type": "text", "text": "{\"planned_actions\": []}"}]
        }));
        assert!(matches!(data, ResponseData::Object(_)));

        let text = parse(json!({
            "content": [{"type": "thinking", "thinking": "..."}, {"type": "text", "text": "plain"}]
        }));
        assert_eq!(text, ResponseData::Text("plain".to_string()));
    }

    #[test]
    fn body_includes_tools_and_choice() {
        let tools = [decision_tool()];
        let request = CompletionRequest {
            provider: Provider::Anthropic,
            prompt: "p",
            model: "claude",
            max_tokens: 100,
            attempt: 1,
            tools: &tools,
            force_tool_use: true,
        };
        let body = build_request_body(&request);
        assert_eq!(body["tools"][0]["name"], json!("agent_decision"));
        assert!(body["tools"][0]["input_schema"].is_object());
        assert_eq!(body["tool_choice"], json!({"type": "tool", "name": "agent_decision"}));
        assert_eq!(body["messages"][0]["content"], json!("p"));
    }

    #[test]
    fn auth_token_uses_bearer_header() {
        let client = AnthropicClient::new(Client::new(), AnthropicAuth::AuthToken("tok".to_string()));
        let headers = client.headers();
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
        assert!(headers.get("x-api-key").is_none());
        assert_eq!(headers["anthropic-version"], API_VERSION);
    }
}
