//! Final-answer synthesis after a successful `finish`.
//!
//! One extra tool-free model call turns the collected tool output into a
//! direct answer. Any failure here falls back to the preliminary finish
//! message; it never fails the run.

use std::fs;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::budget::{compute_token_budget, estimate_tokens};
use crate::core::payload::{ResponseData, extract_json_object, first_text_field, summarize_text};
use crate::core::types::{StepExecutionResult, StepStatus};
use crate::io::events::EventType;
use crate::io::prompt::{Evidence, PromptBuild, build_final_answer_prompt};
use crate::io::transcript::{AttemptStatus, CallSite};

use super::RunContext;
use super::invoke::{ModelCall, invoke_with_retry};

const EVIDENCE_CHAR_LIMIT: usize = 7000;
const SYNTHESIS_MAX_TOKENS: u32 = 1400;
const SUMMARY_PREVIEW_CHARS: usize = 250;
const ANSWER_KEYS: [&str; 4] = ["final_answer", "answer", "summary", "final_summary"];
const MISSING_FINAL_ANSWER: &str = "missing_final_answer";
const MISSING_ANSWER_REASON: &str = "Mapped to response because final answer synthesis response did not contain a final answer field.";
const ANSWER_REASON: &str = "Mapped to response because final answer synthesis returned a direct answer.";

/// Stdout of every successful step that wrote an artifact, trimmed and clipped.
pub(super) fn collect_evidence(results: &[StepExecutionResult]) -> Vec<Evidence> {
    results
        .iter()
        .filter(|result| result.status == StepStatus::Success)
        .filter_map(|result| {
            let path = result.stdout_artifact.as_ref()?;
            let stdout = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    debug!(path = %path.display(), %err, "evidence artifact unreadable");
                    return None;
                }
            };
            let stdout: String = stdout.trim().chars().take(EVIDENCE_CHAR_LIMIT).collect();
            (!stdout.is_empty()).then(|| Evidence {
                step_id: format!("turn_{}_{}", result.turn_index, result.step_id),
                stdout,
            })
        })
        .collect()
}

/// The answer text of a synthesis response.
///
/// Text that embeds no JSON object is taken as the answer itself.
pub(super) fn extract_final_answer(data: &ResponseData) -> Option<String> {
    let answer = match data {
        ResponseData::Object(map) => first_text_field(map, &ANSWER_KEYS).map(str::to_string),
        ResponseData::Text(text) => match extract_json_object(text) {
            Some(map) => first_text_field(&map, &ANSWER_KEYS).map(str::to_string),
            None => Some(text.trim().to_string()),
        },
    };
    answer.filter(|text| !text.is_empty())
}

/// Returns the synthesized answer, or `None` to keep the preliminary message.
pub(super) fn synthesize_final_answer(
    ctx: &RunContext<'_>,
    step_results: &[StepExecutionResult],
    turn: u32,
    preliminary: Option<&str>,
) -> Result<Option<String>> {
    let evidence = collect_evidence(step_results);
    if evidence.is_empty() {
        return Ok(None);
    }
    let prompt = build_final_answer_prompt(ctx.task, preliminary, &evidence)?;
    ctx.store
        .write_artifact(&format!("artifacts/final_answer_prompt_turn_{turn}.txt"), &prompt)?;
    let estimated_input_tokens = estimate_tokens(&prompt);
    ctx.emit(
        EventType::FinalAnswerSynthesisStarted,
        json!({
            "turn_index": turn,
            "estimated_input_tokens": estimated_input_tokens,
            "evidence_items": evidence.len(),
        }),
    )?;

    let build = PromptBuild {
        budget: compute_token_budget(
            ctx.config.model.max_context_tokens,
            ctx.config.model.response_headroom_tokens,
            "",
        ),
        prompt,
        estimated_input_tokens,
        dropped_sections: Vec::new(),
        omitted_disclosures: Vec::new(),
    };
    let max_tokens = SYNTHESIS_MAX_TOKENS.min(ctx.config.model.max_tokens);
    let outcome = invoke_with_retry(
        ctx,
        &ModelCall::new(CallSite::FinalAnswerSynthesis, turn, &build, max_tokens),
        1,
    )?;
    let Some(completion) = outcome.completion else {
        ctx.emit(
            EventType::FinalAnswerSynthesisFailed,
            json!({
                "turn_index": turn,
                "reason": outcome.error.as_deref().unwrap_or("unknown"),
            }),
        )?;
        return Ok(None);
    };
    ctx.store.write_artifact(
        &format!("artifacts/final_answer_response_turn_{turn}.txt"),
        &ctx.scrubber.apply(&completion.data.render()),
    )?;

    let mut record = outcome.record;
    match extract_final_answer(&completion.data) {
        Some(answer) => {
            record.decode_success = true;
            record.response_kind_reason = Some(ANSWER_REASON.to_string());
            record.finish_summary = Some(answer.clone());
            ctx.write_transcript(&record)?;
            ctx.emit(
                EventType::FinalAnswerSynthesisCompleted,
                json!({
                    "turn_index": turn,
                    "summary_preview": summarize_text(&answer, SUMMARY_PREVIEW_CHARS),
                }),
            )?;
            Ok(Some(answer))
        }
        None => {
            warn!(turn, "final answer synthesis returned no answer");
            record.status = AttemptStatus::DecodeFailed;
            record.error = Some(MISSING_FINAL_ANSWER.to_string());
            record.response_kind_reason = Some(MISSING_ANSWER_REASON.to_string());
            ctx.write_transcript(&record)?;
            ctx.emit(
                EventType::FinalAnswerSynthesisFailed,
                json!({"turn_index": turn, "reason": MISSING_FINAL_ANSWER}),
            )?;
            Ok(None)
        }
    }
}
