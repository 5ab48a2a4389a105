//! Model invocation with retry, request/response artifacts and transcript records.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::payload::summarize_text;
use crate::core::retry::compute_backoff_delay;
use crate::core::types::{ResponseKind, TokenBudget};
use crate::io::events::EventType;
use crate::io::prompt::PromptBuild;
use crate::io::transcript::{AttemptStatus, CallSite, TranscriptRecord};
use crate::llm::{Completion, CompletionRequest, ToolSpec, Usage, raw_request_summary};

use super::RunContext;

const REQUEST_FAILED_REASON: &str =
    "Mapped to response because the LLM request failed before decoding.";
const RESPONSE_PREVIEW_CHARS: usize = 400;

/// Everything fixed across the attempts of one model call.
#[derive(Debug, Clone, Copy)]
pub(super) struct ModelCall<'c> {
    pub call_site: CallSite,
    pub turn: u32,
    pub prompt: &'c str,
    pub budget: TokenBudget,
    pub estimated_tokens: usize,
    pub disclosed_paths: &'c [String],
    pub tools: &'c [ToolSpec],
    pub force_tool_use: bool,
    pub max_tokens: u32,
}

impl<'c> ModelCall<'c> {
    pub fn new(call_site: CallSite, turn: u32, build: &'c PromptBuild, max_tokens: u32) -> Self {
        Self {
            call_site,
            turn,
            prompt: &build.prompt,
            budget: build.budget,
            estimated_tokens: build.estimated_input_tokens,
            disclosed_paths: &[],
            tools: &[],
            force_tool_use: false,
            max_tokens,
        }
    }

    pub fn with_disclosed_paths(mut self, paths: &'c [String]) -> Self {
        self.disclosed_paths = paths;
        self
    }

    pub fn with_tools(mut self, tools: &'c [ToolSpec], force_tool_use: bool) -> Self {
        self.tools = tools;
        self.force_tool_use = force_tool_use;
        self
    }

    /// Transcript record for `attempt`, pre-filled with the request side.
    fn record(
        &self,
        ctx: &RunContext<'_>,
        attempt: u32,
        raw_request_text: String,
    ) -> TranscriptRecord {
        TranscriptRecord {
            turn_index: self.turn,
            attempt,
            call_site: self.call_site,
            provider: ctx.provider.as_str().to_string(),
            model: ctx.config.model.name.clone(),
            status: AttemptStatus::Success,
            raw_request_text,
            prompt_text: self.prompt.to_string(),
            response_text: None,
            prompt_estimated_tokens: self.estimated_tokens,
            budget: self.budget,
            disclosed_paths: self.disclosed_paths.to_vec(),
            usage: Usage::default(),
            decode_success: false,
            selected_skill: None,
            raw_action_types: Vec::new(),
            planned_action_types: Vec::new(),
            required_disclosure_paths: Vec::new(),
            response_kind: ResponseKind::Response,
            response_kind_reason: None,
            finish_summary: None,
            error: None,
            retryable: None,
        }
    }
}

/// Result of the retry loop.
///
/// `record` describes the last attempt. On success it already carries the
/// response text and usage; the caller fills in the decode side and writes it.
pub(super) struct InvokeOutcome {
    pub completion: Option<Completion>,
    pub record: TranscriptRecord,
    pub error: Option<String>,
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// Call the model, retrying retryable failures up to `runtime.max_llm_retries` times.
///
/// Attempts are numbered from `first_attempt` so a fallback call continues
/// the numbering of the call it replaces. Failed attempts are written to the
/// transcript here.
pub(super) fn invoke_with_retry(
    ctx: &RunContext<'_>,
    call: &ModelCall<'_>,
    first_attempt: u32,
) -> Result<InvokeOutcome> {
    let runtime = &ctx.config.runtime;
    let base = seconds(runtime.retry_base_delay_secs);
    let max = seconds(runtime.retry_max_delay_secs);
    let sleep_cap = seconds(runtime.retry_sleep_cap_secs);
    let mut attempt = first_attempt;
    let mut tries = 0u32;

    loop {
        tries += 1;
        let request = CompletionRequest {
            provider: ctx.provider,
            prompt: call.prompt,
            model: &ctx.config.model.name,
            max_tokens: call.max_tokens,
            attempt,
            tools: call.tools,
            force_tool_use: call.force_tool_use,
        };
        let raw_request_text =
            ctx.scrubber
                .apply(&serde_json::to_string_pretty(&raw_request_summary(&request))?);
        let artifact_stem = format!(
            "artifacts/llm/{}_turn_{}_attempt_{}",
            call.call_site, call.turn, attempt
        );
        ctx.store
            .write_artifact(&format!("{artifact_stem}_request.txt"), &raw_request_text)?;
        ctx.emit(
            EventType::LlmRequestSent,
            json!({
                "provider": ctx.provider.as_str(),
                "model": ctx.config.model.name,
                "attempt": attempt,
                "turn_index": call.turn,
                "call_site": call.call_site.as_str(),
            }),
        )?;

        let mut record = call.record(ctx, attempt, raw_request_text);
        match ctx.llm.complete(&request) {
            Ok(completion) => {
                let rendered = completion.data.render();
                ctx.emit(
                    EventType::LlmResponseReceived,
                    json!({
                        "turn_index": call.turn,
                        "call_site": call.call_site.as_str(),
                        "meta": {
                            "provider": ctx.provider.as_str(),
                            "model": ctx.config.model.name,
                            "attempt": attempt,
                            "input_tokens": completion.usage.input_tokens,
                            "output_tokens": completion.usage.output_tokens,
                            "latency_ms": completion.usage.latency_ms,
                        },
                        "response_preview": summarize_text(&rendered, RESPONSE_PREVIEW_CHARS),
                    }),
                )?;
                ctx.store.write_artifact(
                    &format!("{artifact_stem}_response.txt"),
                    &ctx.scrubber.apply(&rendered),
                )?;
                record.response_text = Some(rendered);
                record.usage = completion.usage;
                return Ok(InvokeOutcome {
                    completion: Some(completion),
                    record,
                    error: None,
                });
            }
            Err(err) => {
                let retryable = err.is_retryable();
                let error = err.to_string();
                warn!(attempt, retryable, %error, "model request failed");
                record.status = AttemptStatus::RequestFailed;
                record.error = Some(error.clone());
                record.retryable = Some(retryable);
                record.response_kind_reason = Some(REQUEST_FAILED_REASON.to_string());
                ctx.write_transcript(&record)?;
                ctx.emit(
                    EventType::LlmRequestFailed,
                    json!({
                        "provider": ctx.provider.as_str(),
                        "attempt": attempt,
                        "turn_index": call.turn,
                        "call_site": call.call_site.as_str(),
                        "error": error,
                        "retryable": retryable,
                    }),
                )?;
                if retryable && tries <= runtime.max_llm_retries {
                    let delay = compute_backoff_delay(tries, base, max);
                    ctx.emit(
                        EventType::LlmRetryScheduled,
                        json!({
                            "provider": ctx.provider.as_str(),
                            "attempt": attempt,
                            "turn_index": call.turn,
                            "call_site": call.call_site.as_str(),
                            "delay_seconds": delay.as_secs_f64(),
                            "error": error,
                            "retryable": true,
                        }),
                    )?;
                    let pause = delay.min(sleep_cap);
                    debug!(pause_ms = pause.as_millis(), "sleeping before retry");
                    thread::sleep(pause);
                    attempt += 1;
                    continue;
                }
                return Ok(InvokeOutcome {
                    completion: None,
                    record,
                    error: Some(error),
                });
            }
        }
    }
}
