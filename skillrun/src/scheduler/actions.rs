//! Execution of one turn's planned actions.
//!
//! Actions run in order. The first failed step stops the turn, and so does
//! `finish`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::core::command::normalize_command;
use crate::core::payload::summarize_text;
use crate::core::types::{ActionStep, ActionType, StepExecutionResult, StepStatus};
use crate::io::events::EventType;
use crate::io::executor::{CommandExecution, CommandExecutor};
use crate::mcp::{ToolInfo, ToolManager};

use super::RunContext;

const STEP_SUMMARY_CHARS: usize = 400;
const ASK_USER_SKIPPED: &str = "Skipped ask_user in non-interactive mode";

/// Collaborators available to action steps.
pub(super) struct ActionEnv<'e> {
    pub executor: &'e dyn CommandExecutor,
    /// Tools advertised at connect time, used for argument validation.
    pub mcp_tools: &'e [ToolInfo],
    pub rg_available: bool,
}

#[derive(Debug, Default)]
pub(super) struct TurnExecution {
    pub results: Vec<StepExecutionResult>,
    /// A `finish` action executed.
    pub finished: bool,
}

fn step_result(
    step_id: &str,
    turn: u32,
    status: StepStatus,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> StepExecutionResult {
    StepExecutionResult {
        step_id: step_id.to_string(),
        turn_index: turn,
        exit_code,
        stdout_summary: summarize_text(stdout, STEP_SUMMARY_CHARS),
        stderr_summary: summarize_text(stderr, STEP_SUMMARY_CHARS),
        retry_count: 0,
        status,
        stdout_artifact: None,
        stderr_artifact: None,
    }
}

/// Run `actions` in order. Step ids are `step-<n>`, starting at 1.
pub(super) fn execute_actions<T: ToolManager + ?Sized>(
    ctx: &RunContext<'_>,
    env: &ActionEnv<'_>,
    mut tools: Option<&mut T>,
    turn: u32,
    actions: &[ActionStep],
) -> Result<TurnExecution> {
    let mut execution = TurnExecution::default();
    for (idx, action) in actions.iter().enumerate() {
        let step_id = format!("step-{}", idx + 1);
        let result = match action.action_type {
            ActionType::Finish => finish_step(ctx, turn, &step_id, action)?,
            ActionType::RunCommand => run_command_step(ctx, env, turn, &step_id, action)?,
            ActionType::CallSkill => call_skill_step(ctx, turn, &step_id, action)?,
            ActionType::McpCall => {
                mcp_call_step(ctx, env, tools.as_deref_mut(), turn, &step_id, action)?
            }
            ActionType::AskUser => {
                ctx.emit(
                    EventType::SkillStepExecuted,
                    json!({"step_id": step_id, "type": action.action_type.as_str(), "status": "skipped"}),
                )?;
                step_result(&step_id, turn, StepStatus::Skipped, 0, ASK_USER_SKIPPED, "")
            }
        };
        let failed = result.is_failed();
        execution.results.push(result);
        if action.action_type == ActionType::Finish {
            execution.finished = true;
            break;
        }
        if failed {
            break;
        }
    }
    Ok(execution)
}

fn finish_step(
    ctx: &RunContext<'_>,
    turn: u32,
    step_id: &str,
    action: &ActionStep,
) -> Result<StepExecutionResult> {
    let message = action.finish_message();
    let mut payload = json!({
        "step_id": step_id,
        "type": action.action_type.as_str(),
        "status": StepStatus::Success.as_str(),
    });
    if let (Some(message), Some(map)) = (message, payload.as_object_mut()) {
        map.insert("message".to_string(), json!(message));
    }
    ctx.emit(EventType::SkillStepExecuted, payload)?;
    Ok(step_result(
        step_id,
        turn,
        StepStatus::Success,
        0,
        message.unwrap_or_default(),
        "",
    ))
}

fn call_skill_step(
    ctx: &RunContext<'_>,
    turn: u32,
    step_id: &str,
    action: &ActionStep,
) -> Result<StepExecutionResult> {
    let target = action.param_str("skill_name").unwrap_or_default();
    let result = if target.is_empty() {
        step_result(step_id, turn, StepStatus::Failed, 1, "", "Missing skill_name")
    } else {
        step_result(
            step_id,
            turn,
            StepStatus::Success,
            0,
            &format!("Requested handoff to {target}"),
            "",
        )
    };
    ctx.emit(
        EventType::SkillStepExecuted,
        json!({
            "step_id": step_id,
            "type": action.action_type.as_str(),
            "status": result.status.as_str(),
            "target_skill": target,
        }),
    )?;
    Ok(result)
}

fn run_command_step(
    ctx: &RunContext<'_>,
    env: &ActionEnv<'_>,
    turn: u32,
    step_id: &str,
    action: &ActionStep,
) -> Result<StepExecutionResult> {
    let Some(command) = action.param_str("command") else {
        ctx.emit(
            EventType::SkillStepExecuted,
            json!({
                "step_id": step_id,
                "type": action.action_type.as_str(),
                "status": StepStatus::Failed.as_str(),
                "reason": "missing_command",
            }),
        )?;
        return Ok(step_result(step_id, turn, StepStatus::Failed, 1, "", "Missing command"));
    };

    let command = normalize_command(command, env.rg_available);
    let mut execution = env.executor.run(&command);
    let mut retry_count = 0;
    if !execution.succeeded() && ctx.config.runtime.on_step_failure.retries_once() {
        retry_count = 1;
        info!(step_id, exit_code = execution.exit_code, "retrying failed command once");
        ctx.emit(
            EventType::StepRetryScheduled,
            json!({"step_id": step_id, "command": command, "retry_count": retry_count}),
        )?;
        execution = env.executor.run(&command);
    }
    let CommandExecution {
        exit_code,
        stdout,
        stderr,
        ..
    } = execution;

    let stdout_artifact = ctx
        .store
        .write_artifact(&format!("artifacts/turn_{turn}_{step_id}_stdout.txt"), &stdout)?;
    let stderr_artifact = if stderr.is_empty() {
        None
    } else {
        Some(
            ctx.store
                .write_artifact(&format!("artifacts/turn_{turn}_{step_id}_stderr.txt"), &stderr)?,
        )
    };
    let status = if exit_code == 0 {
        StepStatus::Success
    } else {
        warn!(step_id, exit_code, "command failed");
        StepStatus::Failed
    };
    let result = StepExecutionResult {
        retry_count,
        stdout_artifact: Some(stdout_artifact),
        stderr_artifact,
        ..step_result(step_id, turn, status, exit_code, &stdout, &stderr)
    };
    ctx.emit(
        EventType::SkillStepExecuted,
        json!({
            "step_id": step_id,
            "type": action.action_type.as_str(),
            "command": command,
            "status": status.as_str(),
            "exit_code": exit_code,
            "stdout": result.stdout_summary,
            "stderr": result.stderr_summary,
            "stdout_artifact": result.stdout_artifact,
            "stderr_artifact": result.stderr_artifact,
            "retry_count": retry_count,
        }),
    )?;
    Ok(result)
}

/// Why an `mcp_call` step cannot be dispatched, if it cannot.
fn mcp_precheck(
    tool_name: &str,
    arguments: Option<&Value>,
    available: bool,
    tools: &[ToolInfo],
) -> Result<Map<String, Value>, String> {
    if tool_name.is_empty() {
        return Err("missing_tool_name".to_string());
    }
    if !available {
        return Err("mcp_not_available".to_string());
    }
    let arguments = match arguments {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err("arguments must be a JSON object".to_string()),
    };
    if let Some(tool) = tools.iter().find(|tool| tool.name == tool_name) {
        validate_arguments(&tool.input_schema, &arguments)?;
    }
    Ok(arguments)
}

fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), String> {
    if !schema.is_object() {
        return Ok(());
    }
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| format!("invalid input schema: {err}"))?;
    let instance = Value::Object(arguments.clone());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("arguments do not match input schema: {}", errors.join("; ")))
    }
}

fn mcp_failure(
    ctx: &RunContext<'_>,
    turn: u32,
    step_id: &str,
    tool_name: &str,
    error: &str,
) -> Result<StepExecutionResult> {
    warn!(step_id, tool_name, error, "MCP call failed");
    ctx.emit(
        EventType::McpToolCallFailed,
        json!({"step_id": step_id, "tool_name": tool_name, "error": error}),
    )?;
    Ok(step_result(
        step_id,
        turn,
        StepStatus::Failed,
        1,
        "",
        &format!("MCP call failed: {error}"),
    ))
}

fn mcp_call_step<T: ToolManager + ?Sized>(
    ctx: &RunContext<'_>,
    env: &ActionEnv<'_>,
    tools: Option<&mut T>,
    turn: u32,
    step_id: &str,
    action: &ActionStep,
) -> Result<StepExecutionResult> {
    let tool_name = action.param_str("tool_name").unwrap_or_default();
    let arguments = match mcp_precheck(
        tool_name,
        action.params.get("arguments"),
        tools.is_some(),
        env.mcp_tools,
    ) {
        Ok(arguments) => arguments,
        Err(reason) => return mcp_failure(ctx, turn, step_id, tool_name, &reason),
    };
    let Some(tools) = tools else {
        return mcp_failure(ctx, turn, step_id, tool_name, "mcp_not_available");
    };

    ctx.emit(
        EventType::McpToolCallStarted,
        json!({
            "step_id": step_id,
            "tool_name": tool_name,
            "arguments_keys": arguments.keys().collect::<Vec<_>>(),
        }),
    )?;
    let timeout = Duration::from_secs(ctx.config.mcp.tool_call_timeout_secs);
    let outcome = match tools.call(tool_name, arguments, timeout) {
        Ok(outcome) => outcome,
        Err(err) => return mcp_failure(ctx, turn, step_id, tool_name, &format!("{err:#}")),
    };

    let artifact: PathBuf = ctx.store.write_artifact(
        &format!("artifacts/turn_{turn}_{step_id}_mcp_stdout.txt"),
        &outcome.raw_text,
    )?;
    let (status, exit_code, stderr) = if outcome.is_error {
        (StepStatus::Failed, 1, "MCP tool returned error")
    } else {
        (StepStatus::Success, 0, "")
    };
    ctx.emit(
        EventType::McpToolCallCompleted,
        json!({
            "step_id": step_id,
            "tool_name": tool_name,
            "server": outcome.server,
            "status": status.as_str(),
            "is_error": outcome.is_error,
            "stdout_artifact": artifact,
        }),
    )?;
    Ok(StepExecutionResult {
        stdout_artifact: Some(artifact),
        ..step_result(step_id, turn, status, exit_code, &outcome.raw_text, stderr)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(schema: Value) -> ToolInfo {
        ToolInfo {
            server: "files".to_string(),
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            input_schema: schema,
        }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    #[test]
    fn precheck_reports_missing_name_before_availability() {
        assert_eq!(
            mcp_precheck("", None, false, &[]),
            Err("missing_tool_name".to_string())
        );
        assert_eq!(
            mcp_precheck("read_file", None, false, &[]),
            Err("mcp_not_available".to_string())
        );
    }

    #[test]
    fn precheck_rejects_non_object_arguments() {
        let err = mcp_precheck("read_file", Some(&json!([1, 2])), true, &[]).expect_err("array");
        assert!(err.contains("JSON object"));
    }

    #[test]
    fn precheck_validates_against_advertised_schema() {
        let tools = [tool(schema())];
        let ok = mcp_precheck("read_file", Some(&json!({"path": "README.md"})), true, &tools)
            .expect("valid arguments");
        assert_eq!(ok.get("path"), Some(&json!("README.md")));

        let err = mcp_precheck("read_file", Some(&json!({"path": 3})), true, &tools)
            .expect_err("wrong type");
        assert!(err.starts_with("arguments do not match input schema"));

        let err = mcp_precheck("read_file", None, true, &tools).expect_err("missing path");
        assert!(err.contains("path"));
    }

    #[test]
    fn unknown_tools_skip_schema_validation() {
        let args = mcp_precheck("other", Some(&json!({"x": 1})), true, &[tool(schema())])
            .expect("no schema to check");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn step_summaries_are_clipped() {
        let long = "y".repeat(1000);
        let result = step_result("step-1", 1, StepStatus::Success, 0, &long, "");
        assert_eq!(result.stdout_summary.chars().count(), STEP_SUMMARY_CHARS);
        assert!(result.stdout_summary.ends_with("..."));
        assert!(result.stderr_summary.is_empty());
    }
}
