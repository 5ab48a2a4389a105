//! Append-only JSONL event log for a run.
//!
//! Every record carries the run id, a per-bus trace id, a fresh span id and an
//! RFC 3339 timestamp. Top-level string payload values are scrubbed before
//! they are written.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::core::redaction::Scrubber;

pub const REDACTION_MODE: &str = "redacted";

/// Stable event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    SkillCatalogLoaded,
    SkillParseFailed,
    PreparedSkillsIgnored,
    SkillPrefilterCompleted,
    SkillDisclosureLoaded,
    McpServersConnected,
    McpConnectionFailed,
    McpServersDisconnected,
    PromptBudgetComputed,
    PromptComposed,
    SelfHandoffConstraintApplied,
    LlmRequestSent,
    LlmResponseReceived,
    LlmRequestFailed,
    LlmRetryScheduled,
    NativeToolFallback,
    LlmDecisionDecoded,
    SelfHandoffRecoveryApplied,
    SelfHandoffDetected,
    SkillInvocationStarted,
    SkillInvocationFinished,
    SkillStepExecuted,
    StepRetryScheduled,
    McpToolCallStarted,
    McpToolCallCompleted,
    McpToolCallFailed,
    FinalAnswerSynthesisStarted,
    FinalAnswerSynthesisCompleted,
    FinalAnswerSynthesisFailed,
    SignalReceived,
    GracefulShutdownStarted,
    LlmTranscriptWriteFailed,
    RunFinished,
    RunFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::SkillCatalogLoaded => "skill_catalog_loaded",
            EventType::SkillParseFailed => "skill_parse_failed",
            EventType::PreparedSkillsIgnored => "prepared_skills_ignored",
            EventType::SkillPrefilterCompleted => "skill_prefilter_completed",
            EventType::SkillDisclosureLoaded => "skill_disclosure_loaded",
            EventType::McpServersConnected => "mcp_servers_connected",
            EventType::McpConnectionFailed => "mcp_connection_failed",
            EventType::McpServersDisconnected => "mcp_servers_disconnected",
            EventType::PromptBudgetComputed => "prompt_budget_computed",
            EventType::PromptComposed => "prompt_composed",
            EventType::SelfHandoffConstraintApplied => "self_handoff_constraint_applied",
            EventType::LlmRequestSent => "llm_request_sent",
            EventType::LlmResponseReceived => "llm_response_received",
            EventType::LlmRequestFailed => "llm_request_failed",
            EventType::LlmRetryScheduled => "llm_retry_scheduled",
            EventType::NativeToolFallback => "native_tool_fallback",
            EventType::LlmDecisionDecoded => "llm_decision_decoded",
            EventType::SelfHandoffRecoveryApplied => "self_handoff_recovery_applied",
            EventType::SelfHandoffDetected => "self_handoff_detected",
            EventType::SkillInvocationStarted => "skill_invocation_started",
            EventType::SkillInvocationFinished => "skill_invocation_finished",
            EventType::SkillStepExecuted => "skill_step_executed",
            EventType::StepRetryScheduled => "step_retry_scheduled",
            EventType::McpToolCallStarted => "mcp_tool_call_started",
            EventType::McpToolCallCompleted => "mcp_tool_call_completed",
            EventType::McpToolCallFailed => "mcp_tool_call_failed",
            EventType::FinalAnswerSynthesisStarted => "final_answer_synthesis_started",
            EventType::FinalAnswerSynthesisCompleted => "final_answer_synthesis_completed",
            EventType::FinalAnswerSynthesisFailed => "final_answer_synthesis_failed",
            EventType::SignalReceived => "signal_received",
            EventType::GracefulShutdownStarted => "graceful_shutdown_started",
            EventType::LlmTranscriptWriteFailed => "llm_transcript_write_failed",
            EventType::RunFinished => "run_finished",
            EventType::RunFailed => "run_failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub timestamp: String,
    pub event_type: EventType,
    pub payload: Map<String, Value>,
    pub redaction_mode: String,
}

/// Observer invoked after each record is appended (progress output, UIs).
pub type EventCallback = Box<dyn Fn(&EventRecord) + Send + Sync>;

pub struct EventBus {
    path: PathBuf,
    run_id: String,
    trace_id: String,
    scrubber: Scrubber,
    write_lock: Mutex<()>,
    on_emit: Option<EventCallback>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("path", &self.path)
            .field("run_id", &self.run_id)
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(path: PathBuf, run_id: &str, scrubber: Scrubber) -> Self {
        Self {
            path,
            run_id: run_id.to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
            scrubber,
            write_lock: Mutex::new(()),
            on_emit: None,
        }
    }

    pub fn with_callback(mut self, callback: EventCallback) -> Self {
        self.on_emit = Some(callback);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one record. `payload` must be a JSON object (anything else is wrapped as `value`).
    pub fn emit(&self, event_type: EventType, payload: Value) -> Result<EventRecord> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        let record = EventRecord {
            run_id: self.run_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event_type,
            payload: self.scrub_payload(payload),
            redaction_mode: REDACTION_MODE.to_string(),
        };
        let line = serde_json::to_string(&record).context("serialize event record")?;
        {
            let _guard = self
                .write_lock
                .lock()
                .map_err(|_| anyhow!("event log lock poisoned"))?;
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create event dir {}", parent.display()))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("open event log {}", self.path.display()))?;
            writeln!(file, "{line}")
                .with_context(|| format!("append event log {}", self.path.display()))?;
        }
        debug!(event_type = %event_type, "event emitted");
        if let Some(callback) = &self.on_emit {
            callback(&record);
        }
        Ok(record)
    }

    fn scrub_payload(&self, payload: Map<String, Value>) -> Map<String, Value> {
        payload
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(text) => (key, Value::String(self.scrubber.apply(&text))),
                other => (key, other),
            })
            .collect()
    }
}

/// Read every record of an event log, skipping blank lines.
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read event log {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse event {} of {}", idx + 1, path.display()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn appends_scrubbed_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bus = EventBus::new(temp.path().join("events.jsonl"), "run-1", Scrubber::default());

        bus.emit(EventType::RunStarted, json!({"task": "use api_key=abc\u{7}"}))
            .expect("emit");
        bus.emit(EventType::RunFinished, json!({"turn_index": 1, "nested": {"token": "token=x"}}))
            .expect("emit");

        let events = read_events(bus.path()).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[0].payload["task"], json!("use api_key=***REDACTED***"));
        assert_eq!(events[0].trace_id, events[1].trace_id);
        assert_eq!(events[0].span_id.len(), 12);
        assert_eq!(events[1].redaction_mode, "redacted");
        // Only top-level strings are scrubbed.
        assert_eq!(events[1].payload["nested"], json!({"token": "token=x"}));
    }

    #[test]
    fn event_type_serializes_to_its_name() {
        let value = serde_json::to_value(EventType::SelfHandoffRecoveryApplied).expect("value");
        assert_eq!(value, json!("self_handoff_recovery_applied"));
        assert_eq!(EventType::LlmTranscriptWriteFailed.as_str(), "llm_transcript_write_failed");
    }

    #[test]
    fn callback_sees_every_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let bus = EventBus::new(temp.path().join("events.jsonl"), "run-1", Scrubber::default())
            .with_callback(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        bus.emit(EventType::SignalReceived, json!({"signal": "SIGINT"}))
            .expect("emit");
        bus.emit(EventType::RunFailed, Value::Null).expect("emit");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
