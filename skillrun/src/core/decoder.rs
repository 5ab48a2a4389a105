//! Decision decoder: turns unreliable model output into a validated [`ModelDecision`].
//!
//! Decoding is an ordered pipeline of total passes over a loosely-typed JSON
//! map, followed by a single strict gate:
//!
//! 1. extract a JSON object from the response (object, or `{...}` inside text)
//! 2. fill top-level defaults
//! 3. normalize each planned action: lift stray keys into `params`, resolve the
//!    action type through skill and global alias tables or infer it from shape,
//!    inject per-skill default commands, demote anything unexecutable to
//!    `ask_user`
//! 4. validate against the embedded JSON Schema, then deserialize
//!
//! Only step 1 and step 4 can fail.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::payload::ResponseData;
use crate::core::types::{ActionStep, ActionType, ModelDecision};

const DECISION_SCHEMA: &str = include_str!("../../schemas/model_decision.schema.json");

const RAW_TYPE_KEYS: [&str; 5] = ["type", "action_type", "action", "step_type", "operation"];
const LIFTED_KEYS: [&str; 6] = [
    "command",
    "skill_name",
    "tool_name",
    "arguments",
    "message",
    "summary",
];
const COMPLETION_FLAGS: [&str; 3] = ["done", "finished", "final"];

pub const DEFAULT_REASONING: &str = "No reasoning supplied by model";
pub const MARKDOWN_DISCOVERY_COMMAND: &str = r#"rg --files -g "*.md""#;

static GLOBAL_ALIASES: LazyLock<BTreeMap<&'static str, ActionType>> = LazyLock::new(|| {
    BTreeMap::from([
        ("execute_skill", ActionType::CallSkill),
        ("invoke_skill", ActionType::CallSkill),
        ("use_skill", ActionType::CallSkill),
        ("handoff", ActionType::CallSkill),
        ("run", ActionType::RunCommand),
        ("run_shell", ActionType::RunCommand),
        ("shell", ActionType::RunCommand),
        ("execute_command", ActionType::RunCommand),
        ("identify_markdown_files", ActionType::RunCommand),
        ("request_disclosure", ActionType::AskUser),
        ("format_output", ActionType::Finish),
        ("summarize_output", ActionType::Finish),
        ("complete", ActionType::Finish),
        ("done", ActionType::Finish),
        ("call_tool", ActionType::McpCall),
        ("use_tool", ActionType::McpCall),
    ])
});

static DECISION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(DECISION_SCHEMA).expect("decision schema should be valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("decision schema should compile")
});

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("could not extract a JSON object from model output")]
    NotJson,
    #[error("decision failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("decision could not be deserialized: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// Per-skill repair tables built from skill frontmatter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderTables {
    /// skill name -> raw action name -> target action name.
    pub action_aliases: BTreeMap<String, BTreeMap<String, String>>,
    /// skill name -> (action name, default params) in declaration order.
    pub default_action_params: BTreeMap<String, Vec<(String, Map<String, Value>)>>,
}

impl DecoderTables {
    fn resolve_alias(&self, raw: &str, selected: Option<&str>) -> Option<ActionType> {
        let lookup = |table: &BTreeMap<String, String>| {
            table.get(raw).and_then(|target| canonical_or_global(target))
        };
        if let Some(kind) = selected
            .and_then(|skill| self.action_aliases.get(skill))
            .and_then(lookup)
        {
            return Some(kind);
        }
        self.action_aliases.values().find_map(lookup)
    }

    fn default_params(&self, names: &[&str], selected: Option<&str>) -> Option<&Map<String, Value>> {
        fn find_in<'t>(
            entries: &'t [(String, Map<String, Value>)],
            names: &[&str],
        ) -> Option<&'t Map<String, Value>> {
            names.iter().find_map(|name| {
                entries
                    .iter()
                    .find(|(action, _)| action == name)
                    .map(|(_, params)| params)
            })
        }

        if let Some(params) = selected
            .and_then(|skill| self.default_action_params.get(skill))
            .and_then(|entries| find_in(entries, names))
        {
            return Some(params);
        }
        self.default_action_params
            .values()
            .find_map(|entries| find_in(entries, names))
    }

    /// Trimmed, unique `command` values declared by `skill`, in order.
    pub fn default_commands(&self, skill: &str, limit: usize) -> Vec<String> {
        let mut commands: Vec<String> = Vec::new();
        for (_, params) in self.default_action_params.get(skill).into_iter().flatten() {
            let Some(command) = params
                .get("command")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|command| !command.is_empty())
            else {
                continue;
            };
            if !commands.iter().any(|existing| existing == command) {
                commands.push(command.to_string());
            }
            if commands.len() >= limit {
                break;
            }
        }
        commands
    }
}

fn canonical_or_global(name: &str) -> Option<ActionType> {
    let name = name.trim();
    ActionType::parse(name).or_else(|| GLOBAL_ALIASES.get(name).copied())
}

/// Decode a raw model response into a validated decision.
pub fn decode_model_decision(
    raw: &ResponseData,
    tables: &DecoderTables,
) -> Result<ModelDecision, DecodeError> {
    let payload = raw.to_object().ok_or(DecodeError::NotJson)?;
    let repaired = repair_payload(payload, tables);
    let value = Value::Object(repaired);
    let errors: Vec<String> = DECISION_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(DecodeError::Schema(errors));
    }
    Ok(serde_json::from_value(value)?)
}

/// Deterministic single-`finish` decision.
pub fn make_finish_decision(reason: &str) -> ModelDecision {
    ModelDecision {
        selected_skill: None,
        reasoning_summary: reason.to_string(),
        required_disclosure_paths: Vec::new(),
        planned_actions: vec![ActionStep::finish(None)],
    }
}

/// Raw action type strings as the model wrote them, before normalization.
pub fn raw_action_types(raw: &ResponseData) -> Vec<String> {
    let Some(payload) = raw.to_object() else {
        return Vec::new();
    };
    let Some(Value::Array(actions)) = payload.get("planned_actions") else {
        return Vec::new();
    };
    actions
        .iter()
        .filter_map(Value::as_object)
        .map(|step| raw_type(step).unwrap_or_default())
        .collect()
}

/// Apply every repair pass. Never fails.
pub fn repair_payload(mut payload: Map<String, Value>, tables: &DecoderTables) -> Map<String, Value> {
    match payload.get("selected_skill") {
        Some(Value::String(name)) if name.trim().is_empty() => {
            payload.insert("selected_skill".to_string(), Value::Null);
        }
        Some(Value::String(name)) => {
            let trimmed = name.trim().to_string();
            payload.insert("selected_skill".to_string(), Value::String(trimmed));
        }
        _ => {}
    }
    if matches!(payload.get("reasoning_summary"), None | Some(Value::Null)) {
        payload.insert(
            "reasoning_summary".to_string(),
            Value::String(DEFAULT_REASONING.to_string()),
        );
    }
    match payload.get("required_disclosure_paths") {
        None | Some(Value::Null) => {
            payload.insert("required_disclosure_paths".to_string(), json!([]));
        }
        Some(Value::String(path)) => {
            let wrapped = json!([path]);
            payload.insert("required_disclosure_paths".to_string(), wrapped);
        }
        _ => {}
    }

    let selected = payload
        .get("selected_skill")
        .and_then(Value::as_str)
        .map(str::to_string);
    let actions = match payload.get("planned_actions") {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|step| Value::Object(normalize_action(step, selected.as_deref(), tables)))
                .collect(),
        ),
        Some(_) => None,
    };
    if let Some(mut actions) = actions {
        if actions.is_empty() {
            actions.push(finish_step());
        }
        payload.insert("planned_actions".to_string(), Value::Array(actions));
    }
    payload
}

fn finish_step() -> Value {
    json!({"type": "finish", "params": {}, "expected_output": null})
}

fn raw_type(step: &Map<String, Value>) -> Option<String> {
    RAW_TYPE_KEYS.iter().find_map(|key| {
        step.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn collect_params(step: &Map<String, Value>) -> Map<String, Value> {
    let mut params = ["params", "parameters"]
        .iter()
        .find_map(|key| step.get(*key).and_then(Value::as_object))
        .cloned()
        .unwrap_or_default();
    if !params.contains_key("command")
        && let Some(cmd) = params.remove("cmd")
    {
        params.insert("command".to_string(), cmd);
    }
    for key in LIFTED_KEYS {
        if params.contains_key(key) {
            continue;
        }
        let value = step
            .get(key)
            .or_else(|| (key == "command").then(|| step.get("cmd")).flatten());
        if let Some(value) = value {
            params.insert(key.to_string(), value.clone());
        }
    }
    params
}

fn has_text(params: &Map<String, Value>, key: &str) -> bool {
    params
        .get(key)
        .and_then(Value::as_str)
        .is_some_and(|value| !value.trim().is_empty())
}

fn infer_from_shape(step: &Map<String, Value>, params: &Map<String, Value>) -> Option<ActionType> {
    if has_text(params, "command") {
        return Some(ActionType::RunCommand);
    }
    if has_text(params, "skill_name") {
        return Some(ActionType::CallSkill);
    }
    if has_text(params, "tool_name") {
        return Some(ActionType::McpCall);
    }
    let flagged = COMPLETION_FLAGS
        .iter()
        .any(|flag| step.get(*flag).and_then(Value::as_bool) == Some(true));
    if flagged || step.contains_key("final_answer") || params.contains_key("final_answer") {
        return Some(ActionType::Finish);
    }
    None
}

fn demote(message: String) -> (ActionType, Map<String, Value>) {
    let mut params = Map::new();
    params.insert("message".to_string(), Value::String(message));
    (ActionType::AskUser, params)
}

/// Normalize one planned action into `{type, params, expected_output}`.
fn normalize_action(
    step: &Map<String, Value>,
    selected: Option<&str>,
    tables: &DecoderTables,
) -> Map<String, Value> {
    let raw = raw_type(step);
    let mut params = collect_params(step);
    let resolved = match raw.as_deref() {
        Some(raw) => ActionType::parse(raw)
            .or_else(|| tables.resolve_alias(raw, selected))
            .or_else(|| GLOBAL_ALIASES.get(raw).copied()),
        None => infer_from_shape(step, &params),
    };
    let raw_label = raw.clone().unwrap_or_else(|| "(missing)".to_string());

    let (kind, params) = match resolved {
        None => demote(format!("Unsupported action type: {raw_label}")),
        Some(ActionType::RunCommand) => {
            if !has_text(&params, "command") {
                let mut names: Vec<&str> = Vec::new();
                if let Some(raw) = raw.as_deref() {
                    names.push(raw);
                }
                names.push(ActionType::RunCommand.as_str());
                if let Some(defaults) = tables.default_params(&names, selected) {
                    let mut merged = defaults.clone();
                    merged.extend(params.into_iter().filter(|(_, value)| !value.is_null()));
                    params = merged;
                }
                if !has_text(&params, "command") && raw.as_deref() == Some("identify_markdown_files")
                {
                    params.insert(
                        "command".to_string(),
                        Value::String(MARKDOWN_DISCOVERY_COMMAND.to_string()),
                    );
                }
            }
            if has_text(&params, "command") {
                (ActionType::RunCommand, params)
            } else {
                demote(format!("Non-executable action: {raw_label}"))
            }
        }
        Some(ActionType::CallSkill) => {
            if !has_text(&params, "skill_name")
                && let Some(selected) = selected
            {
                params.insert(
                    "skill_name".to_string(),
                    Value::String(selected.to_string()),
                );
            }
            (ActionType::CallSkill, params)
        }
        Some(ActionType::Finish) => {
            if !params.contains_key("message")
                && let Some(answer) = step
                    .get("final_answer")
                    .or_else(|| params.get("final_answer"))
                    .and_then(Value::as_str)
            {
                let answer = answer.to_string();
                params.insert("message".to_string(), Value::String(answer));
            }
            (ActionType::Finish, params)
        }
        Some(kind) => (kind, params),
    };

    let expected_output = match step.get("expected_output") {
        Some(Value::String(text)) => Value::String(text.clone()),
        _ => Value::Null,
    };
    let mut normalized = Map::new();
    normalized.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    normalized.insert("params".to_string(), Value::Object(params));
    normalized.insert("expected_output".to_string(), expected_output);
    normalized
}
