//! Google Gemini `generateContent` client (blocking).

use std::time::Instant;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::core::payload::ResponseData;
use crate::llm::{Completion, CompletionRequest, ProviderError, Usage, response_from_text};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
        }
    }

    pub fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        debug!(model = request.model, attempt = request.attempt, "gemini request");
        let response = self
            .http
            .post(format!(
                "{BASE_URL}/models/{}:generateContent",
                request.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request_body(request))
            .send()?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }
        let body: GenerateResponse = response.json()?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let usage = Usage {
            input_tokens: body.usage_metadata.as_ref().and_then(|u| u.prompt_token_count),
            output_tokens: body
                .usage_metadata
                .as_ref()
                .and_then(|u| u.candidates_token_count),
            latency_ms: Some(latency_ms),
        };
        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no candidates in response".to_string()))?;
        Ok(Completion {
            data: parse_parts(candidate.content.map(|c| c.parts).unwrap_or_default()),
            usage,
        })
    }
}

pub(crate) fn build_request_body(request: &CompletionRequest<'_>) -> Value {
    let mut generation_config = Map::new();
    generation_config.insert("maxOutputTokens".to_string(), json!(request.max_tokens));
    let mut body = json!({
        "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
    });
    let Some(obj) = body.as_object_mut() else {
        return body;
    };
    if request.tools.is_empty() {
        generation_config.insert("responseMimeType".to_string(), json!("application/json"));
    } else {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
            })
            .collect();
        let mode = if request.force_tool_use { "ANY" } else { "AUTO" };
        obj.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
        obj.insert(
            "toolConfig".to_string(),
            json!({"functionCallingConfig": {"mode": mode}}),
        );
    }
    obj.insert(
        "generationConfig".to_string(),
        Value::Object(generation_config),
    );
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

/// A function call wins; otherwise the joined text is parsed.
fn parse_parts(parts: Vec<Part>) -> ResponseData {
    let mut texts = Vec::new();
    for part in parts {
        if let Some(FunctionCall {
            args: Some(Value::Object(map)),
        }) = part.function_call
        {
            return ResponseData::Object(map);
        }
        if let Some(text) = part.text.filter(|text| !text.trim().is_empty()) {
            texts.push(text);
        }
    }
    response_from_text(&texts.join("\n"))
}
