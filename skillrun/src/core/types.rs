//! Shared domain types for the turn scheduler and decision pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of executable action types.
///
/// The decoder is the only place raw model strings are mapped onto this enum;
/// everything downstream matches on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CallSkill,
    RunCommand,
    AskUser,
    Finish,
    McpCall,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::CallSkill,
        ActionType::RunCommand,
        ActionType::AskUser,
        ActionType::Finish,
        ActionType::McpCall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CallSkill => "call_skill",
            ActionType::RunCommand => "run_command",
            ActionType::AskUser => "ask_user",
            ActionType::Finish => "finish",
            ActionType::McpCall => "mcp_call",
        }
    }

    /// Parse a canonical action name. Aliases are resolved by the decoder, not here.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys that may carry a human-readable message on a `finish` action.
pub const FINISH_MESSAGE_KEYS: [&str; 4] = ["message", "summary", "result", "result_summary"];

/// One unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub expected_output: Option<String>,
}

impl ActionStep {
    pub fn new(action_type: ActionType, params: Map<String, Value>) -> Self {
        Self {
            action_type,
            params,
            expected_output: None,
        }
    }

    pub fn finish(message: Option<&str>) -> Self {
        let mut params = Map::new();
        if let Some(message) = message {
            params.insert("message".to_string(), Value::String(message.to_string()));
        }
        Self::new(ActionType::Finish, params)
    }

    /// Trimmed, non-empty string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Message carried by a `finish` action, if any.
    pub fn finish_message(&self) -> Option<&str> {
        if self.action_type != ActionType::Finish {
            return None;
        }
        FINISH_MESSAGE_KEYS
            .iter()
            .find_map(|key| self.param_str(key))
    }
}

/// One turn's validated model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDecision {
    #[serde(default)]
    pub selected_skill: Option<String>,
    pub reasoning_summary: String,
    #[serde(default)]
    pub required_disclosure_paths: Vec<String>,
    pub planned_actions: Vec<ActionStep>,
}

impl ModelDecision {
    pub fn action_types(&self) -> Vec<ActionType> {
        self.planned_actions
            .iter()
            .map(|action| action.action_type)
            .collect()
    }

    /// First non-empty finish message across planned actions.
    pub fn finish_summary(&self) -> Option<&str> {
        self.planned_actions
            .iter()
            .find_map(ActionStep::finish_message)
    }

    pub fn selected_skill(&self) -> Option<&str> {
        self.selected_skill
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of executing one [`ActionStep`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    /// Turn in which the step ran (step ids restart every turn).
    pub turn_index: u32,
    pub exit_code: i32,
    pub stdout_summary: String,
    pub stderr_summary: String,
    pub retry_count: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_artifact: Option<PathBuf>,
}

impl StepExecutionResult {
    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// A prefilter ranking result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCandidate {
    pub skill_name: String,
    pub score: f64,
    pub reason: String,
}

/// Prompt sizing decision for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_context_tokens: usize,
    pub response_headroom_tokens: usize,
    pub allocated_prompt_tokens: usize,
    pub allocated_disclosure_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// Stable, enumerable vocabulary of run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoSkillsFound,
    PrefilterZeroCandidates,
    MissingProviderApiKey,
    LlmRequestFailed,
    DecodeFailed,
    StepExecutionFailed,
    SelfHandoffLoop,
    Interrupted,
    MaxTurnsExceeded,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoSkillsFound => "no_skills_found",
            FailureReason::PrefilterZeroCandidates => "prefilter_zero_candidates",
            FailureReason::MissingProviderApiKey => "missing_provider_api_key",
            FailureReason::LlmRequestFailed => "llm_request_failed",
            FailureReason::DecodeFailed => "decode_failed",
            FailureReason::StepExecutionFailed => "step_execution_failed",
            FailureReason::SelfHandoffLoop => "self_handoff_loop",
            FailureReason::Interrupted => "interrupted",
            FailureReason::MaxTurnsExceeded => "max_turns_exceeded",
        }
    }

    /// Human-readable message returned in the run result.
    pub fn message(self) -> &'static str {
        match self {
            FailureReason::NoSkillsFound => "No skills found",
            FailureReason::PrefilterZeroCandidates => "No candidate skills matched",
            FailureReason::MissingProviderApiKey => "Missing provider API key",
            FailureReason::LlmRequestFailed => "LLM request failed",
            FailureReason::DecodeFailed => "Failed to decode model response",
            FailureReason::StepExecutionFailed => "Action execution failed",
            FailureReason::SelfHandoffLoop => "Detected repeated self-handoff loop",
            FailureReason::Interrupted => "Interrupted by signal",
            FailureReason::MaxTurnsExceeded => "Max turns exceeded",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a decoded response for the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    SkillCall,
    ToolCall,
    Response,
}

impl ResponseKind {
    pub fn classify(action_types: &[ActionType]) -> Self {
        if action_types.contains(&ActionType::CallSkill) {
            return ResponseKind::SkillCall;
        }
        if action_types
            .iter()
            .any(|kind| matches!(kind, ActionType::RunCommand | ActionType::McpCall))
        {
            return ResponseKind::ToolCall;
        }
        ResponseKind::Response
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::SkillCall => "skill_call",
            ResponseKind::ToolCall => "tool_call",
            ResponseKind::Response => "response",
        }
    }

    /// Explanation recorded next to the classification.
    pub fn reason(self, action_types: &[ActionType]) -> &'static str {
        match self {
            ResponseKind::SkillCall => {
                "Mapped to skill_call because normalized actions include call_skill."
            }
            ResponseKind::ToolCall => {
                "Mapped to tool_call because normalized actions include run_command or mcp_call."
            }
            ResponseKind::Response if action_types.is_empty() => {
                "Mapped to response because no normalized actions were decoded."
            }
            ResponseKind::Response => {
                "Mapped to response because normalized actions have no call_skill/run_command."
            }
        }
    }
}
