//! Human-readable, append-only log of every model call attempt.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::payload::join_or_none;
use crate::core::redaction::Scrubber;
use crate::core::types::{ResponseKind, TokenBudget};
use crate::llm::Usage;

pub const ATTEMPT_START: &str = "=== LLM ATTEMPT START ===";
pub const ATTEMPT_END: &str = "=== LLM ATTEMPT END ===";

/// Which scheduler step issued a model call. Also names its artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSite {
    Decision,
    FinalAnswerSynthesis,
}

impl CallSite {
    pub fn as_str(self) -> &'static str {
        match self {
            CallSite::Decision => "decision",
            CallSite::FinalAnswerSynthesis => "final_answer_synthesis",
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    RequestFailed,
    DecodeFailed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::RequestFailed => "request_failed",
            AttemptStatus::DecodeFailed => "decode_failed",
        }
    }
}

/// One model call attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRecord {
    pub turn_index: u32,
    pub attempt: u32,
    pub call_site: CallSite,
    pub provider: String,
    pub model: String,
    pub status: AttemptStatus,
    pub raw_request_text: String,
    pub prompt_text: String,
    pub response_text: Option<String>,
    pub prompt_estimated_tokens: usize,
    pub budget: TokenBudget,
    pub disclosed_paths: Vec<String>,
    pub usage: Usage,
    pub decode_success: bool,
    pub selected_skill: Option<String>,
    pub raw_action_types: Vec<String>,
    pub planned_action_types: Vec<String>,
    pub required_disclosure_paths: Vec<String>,
    pub response_kind: ResponseKind,
    pub response_kind_reason: Option<String>,
    pub finish_summary: Option<String>,
    pub error: Option<String>,
    pub retryable: Option<bool>,
}

impl TranscriptRecord {
    /// Render the block written between the start and end markers.
    pub fn render(&self) -> String {
        let selected = self.selected_skill.as_deref().unwrap_or("none");
        let normalized = join_or_none(&self.planned_action_types);
        let optional = |value: Option<u64>| value.map_or_else(|| "None".to_string(), |v| v.to_string());
        let lines = [
            ATTEMPT_START.to_string(),
            format!("Turn: {}", self.turn_index),
            format!("Attempt: {}", self.attempt),
            format!("Call Site: {}", self.call_site),
            format!("Provider: {}", self.provider),
            format!("Model: {}", self.model),
            format!("Status: {}", self.status.as_str()),
            format!("Response Kind: {}", self.response_kind.as_str()),
            format!(
                "Decode Success: {}",
                if self.decode_success { "yes" } else { "no" }
            ),
            format!("Selected Skill: {selected}"),
            format!(
                "Raw Action Types (from model response): {}",
                join_or_none(&self.raw_action_types)
            ),
            format!("Normalized Action Types (decoder output): {normalized}"),
            format!("Disclosed Paths: {}", join_or_none(&self.disclosed_paths)),
            format!(
                "Required Disclosure Paths: {}",
                join_or_none(&self.required_disclosure_paths)
            ),
            format!("Prompt Estimated Tokens: {}", self.prompt_estimated_tokens),
            format!(
                "Budget: max_context_tokens={}, response_headroom_tokens={}, allocated_prompt_tokens={}, allocated_disclosure_tokens={}",
                self.budget.max_context_tokens,
                self.budget.response_headroom_tokens,
                self.budget.allocated_prompt_tokens,
                self.budget.allocated_disclosure_tokens
            ),
            format!(
                "Usage: input_tokens={}, output_tokens={}, latency_ms={}",
                optional(self.usage.input_tokens),
                optional(self.usage.output_tokens),
                optional(self.usage.latency_ms)
            ),
            format!(
                "Retryable: {}",
                self.retryable
                    .map_or_else(|| "n/a".to_string(), |r| r.to_string())
            ),
            format!("Error: {}", self.error.as_deref().unwrap_or("none")),
            format!(
                "Response Kind Mapping: {}",
                self.response_kind_reason.as_deref().unwrap_or("n/a")
            ),
            String::new(),
            "--- Raw Request ---".to_string(),
            self.raw_request_text.clone(),
            "--- Request Prompt ---".to_string(),
            self.prompt_text.clone(),
            "--- Raw Model Response ---".to_string(),
            self.response_text.clone().unwrap_or_default(),
            "--- Decode Summary ---".to_string(),
            format!("selected_skill={selected}"),
            format!("response_kind={}", self.response_kind.as_str()),
            format!("normalized_actions={normalized}"),
            format!(
                "finish_summary={}",
                self.finish_summary.as_deref().unwrap_or("none")
            ),
            ATTEMPT_END.to_string(),
            String::new(),
        ];
        lines.join("\n")
    }
}

/// Appends [`TranscriptRecord`] blocks to the run's transcript file.
#[derive(Debug)]
pub struct TranscriptSink {
    path: PathBuf,
    scrubber: Scrubber,
    write_lock: Mutex<()>,
}

impl TranscriptSink {
    pub fn new(path: PathBuf, scrubber: Scrubber) -> Self {
        Self {
            path,
            scrubber,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scrub free text fields, then append the rendered block.
    pub fn write(&self, record: &TranscriptRecord) -> Result<()> {
        let mut record = record.clone();
        record.raw_request_text = self.scrubber.apply(&record.raw_request_text);
        record.prompt_text = self.scrubber.apply(&record.prompt_text);
        record.response_text = record.response_text.map(|text| self.scrubber.apply(&text));
        record.finish_summary = record
            .finish_summary
            .map(|text| self.scrubber.apply(&text));
        record.error = record.error.map(|text| self.scrubber.apply(&text));

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("transcript lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open transcript {}", self.path.display()))?;
        file.write_all(record.render().as_bytes())
            .with_context(|| format!("append transcript {}", self.path.display()))
    }
}

/// Split a transcript into attempt blocks, each ending with the end marker.
pub fn replay_transcript(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("read transcript {}", path.display()))?;
    Ok(text
        .split(ATTEMPT_END)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| format!("{chunk}\n{ATTEMPT_END}"))
        .collect())
}
