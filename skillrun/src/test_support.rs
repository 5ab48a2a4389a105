//! Scripted collaborators and workspace fixtures for scheduler tests.
//!
//! Every double replays a queue of canned replies and records what it was
//! asked, so tests can drive full runs without network access or real
//! subprocesses.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::core::payload::ResponseData;
use crate::io::config::{AgentConfig, McpServerConfig, Provider, StructuredOutputMode};
use crate::io::events::{EventRecord, EventType, read_events};
use crate::io::executor::{CommandExecution, CommandExecutor};
use crate::io::signals::InterruptFlag;
use crate::llm::{Completion, CompletionRequest, ModelProvider, ProviderError, Usage};
use crate::mcp::{ToolCallResult, ToolInfo, ToolManager};
use crate::scheduler::RunResult;

/// A model reply: a JSON object, anything else becomes text.
pub fn reply(value: Value) -> Result<Completion, ProviderError> {
    let data = match value {
        Value::Object(map) => ResponseData::Object(map),
        Value::String(text) => ResponseData::Text(text),
        other => ResponseData::Text(other.to_string()),
    };
    Ok(Completion {
        data,
        usage: Usage {
            input_tokens: Some(100),
            output_tokens: Some(20),
            latency_ms: Some(5),
        },
    })
}

/// A decision with a single `finish` action carrying `summary`.
pub fn finish_reply(summary: &str) -> Result<Completion, ProviderError> {
    reply(json!({
        "reasoning_summary": "done",
        "planned_actions": [{"type": "finish", "params": {"summary": summary}}]
    }))
}

/// A decision running `commands` in order, then finishing with `summary`.
pub fn command_reply(commands: &[&str], summary: &str) -> Result<Completion, ProviderError> {
    let mut actions: Vec<Value> = commands
        .iter()
        .map(|command| json!({"type": "run_command", "params": {"command": command}}))
        .collect();
    actions.push(json!({"type": "finish", "params": {"summary": summary}}));
    reply(json!({"reasoning_summary": "run commands", "planned_actions": actions}))
}

/// What the scripted provider was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub provider: Provider,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub attempt: u32,
    pub tool_names: Vec<String>,
    pub force_tool_use: bool,
}

/// [`ModelProvider`] replaying queued replies in order.
#[derive(Debug)]
pub struct ScriptedProvider {
    configured: bool,
    replies: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<Completion, ProviderError>>) -> Self {
        Self {
            configured: true,
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider reporting missing credentials for every provider.
    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|replies| replies.len()).unwrap_or(0)
    }
}

impl ModelProvider for ScriptedProvider {
    fn is_configured(&self, _provider: Provider) -> bool {
        self.configured
    }

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                provider: request.provider,
                prompt: request.prompt.to_string(),
                model: request.model.to_string(),
                max_tokens: request.max_tokens,
                attempt: request.attempt,
                tool_names: request.tools.iter().map(|tool| tool.name.clone()).collect(),
                force_tool_use: request.force_tool_use,
            });
        }
        self.replies
            .lock()
            .map_err(|_| ProviderError::Other("scripted provider poisoned".to_string()))?
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Other("no scripted reply left".to_string())))
    }
}

/// One canned command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedExec {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedExec {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// [`CommandExecutor`] replaying queued executions and recording commands.
///
/// An exhausted queue yields exit code 127.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queue: Mutex<VecDeque<ScriptedExec>>,
    commands: Mutex<Vec<String>>,
    programs: BTreeSet<String>,
    interrupt: Option<InterruptFlag>,
}

impl ScriptedExecutor {
    pub fn new(executions: Vec<ScriptedExec>) -> Self {
        Self {
            queue: Mutex::new(executions.into()),
            ..Self::default()
        }
    }

    /// Programs reported as available (everything else is missing).
    pub fn with_programs(mut self, programs: &[&str]) -> Self {
        self.programs = programs.iter().map(|name| name.to_string()).collect();
        self
    }

    /// Request `flag` from inside every command, as a signal arriving mid-step would.
    pub fn interrupting(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn run(&self, command: &str) -> CommandExecution {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
        if let Some(flag) = &self.interrupt {
            flag.request("SIGINT");
        }
        let next = self.queue.lock().ok().and_then(|mut queue| queue.pop_front());
        let exec = next.unwrap_or_else(|| ScriptedExec::failed(127, "no scripted execution left"));
        CommandExecution {
            command: command.to_string(),
            exit_code: exec.exit_code,
            stdout: exec.stdout,
            stderr: exec.stderr,
        }
    }

    fn program_available(&self, program: &str) -> bool {
        self.programs.contains(program)
    }
}

/// [`ToolManager`] advertising fixed tools and replaying queued call results.
#[derive(Debug, Default)]
pub struct ScriptedToolManager {
    tools: Vec<ToolInfo>,
    connect_error: Option<String>,
    results: VecDeque<Result<ToolCallResult, String>>,
    calls: Vec<(String, Map<String, Value>)>,
    connects: usize,
    closes: usize,
}

impl ScriptedToolManager {
    pub fn new(tools: Vec<ToolInfo>, results: Vec<Result<ToolCallResult, String>>) -> Self {
        Self {
            tools,
            results: results.into(),
            ..Self::default()
        }
    }

    /// A manager whose `connect` fails with `error`.
    pub fn failing(error: &str) -> Self {
        Self {
            connect_error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> &[(String, Map<String, Value>)] {
        &self.calls
    }

    pub fn connects(&self) -> usize {
        self.connects
    }

    pub fn closes(&self) -> usize {
        self.closes
    }
}

impl ToolManager for ScriptedToolManager {
    fn connect(&mut self, _servers: &BTreeMap<String, McpServerConfig>) -> Result<Vec<ToolInfo>> {
        self.connects += 1;
        match &self.connect_error {
            Some(error) => Err(anyhow!("{error}")),
            None => Ok(self.tools.clone()),
        }
    }

    fn call(
        &mut self,
        tool_name: &str,
        arguments: Map<String, Value>,
        _timeout: Duration,
    ) -> Result<ToolCallResult> {
        self.calls.push((tool_name.to_string(), arguments));
        self.results
            .pop_front()
            .unwrap_or_else(|| Err("no scripted tool result left".to_string()))
            .map_err(|error| anyhow!(error))
    }

    fn close(&mut self) -> Result<()> {
        self.closes += 1;
        Ok(())
    }
}

/// A tool with a single required string argument `path`.
pub fn path_tool(server: &str, name: &str) -> ToolInfo {
    ToolInfo {
        server: server.to_string(),
        name: name.to_string(),
        description: format!("{name} on {server}"),
        input_schema: json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        }),
    }
}

/// A successful tool result carrying `text`.
pub fn tool_text(server: &str, name: &str, text: &str) -> ToolCallResult {
    ToolCallResult {
        server: server.to_string(),
        tool_name: name.to_string(),
        content: vec![json!({"type": "text", "text": text})],
        is_error: false,
        raw_text: text.to_string(),
    }
}

/// Temporary directory holding a skills tree and the run output directory.
#[derive(Debug)]
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp workspace")?;
        fs::create_dir_all(temp.path().join("skills")).context("create skills dir")?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root().join("skills")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root().join("runs")
    }

    /// Write `skills/<dir_name>/SKILL.md` verbatim.
    pub fn write_skill_file(&self, dir_name: &str, contents: &str) -> Result<PathBuf> {
        self.write_file(&format!("skills/{dir_name}/SKILL.md"), contents)
    }

    /// A skill with two body sections and optional extra frontmatter lines.
    pub fn write_skill(&self, name: &str, description: &str, extra_frontmatter: &str) -> Result<PathBuf> {
        let contents = format!(
            "---\nname: {name}\ndescription: {description}\ntags: [demo]\n{extra_frontmatter}---\n\
             # Purpose\n{description}\n\n# Steps\nList the workspace files and summarize them.\n\n\
             # Notes\nOnly disclosed on request.\n"
        );
        self.write_skill_file(name, &contents)
    }

    /// Write a file relative to the workspace root, creating parents.
    pub fn write_file(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Config pointing at this workspace: plain JSON prompts, no retry delays,
    /// no MCP servers.
    pub fn config(&self) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.skills.dir = self.skills_dir();
        config.skills.prefilter_min_score = 0.0;
        config.logging.jsonl_dir = self.runs_dir();
        config.model.structured_output_mode = StructuredOutputMode::JsonOnly;
        config.runtime.retry_base_delay_secs = 0.0;
        config.runtime.retry_max_delay_secs = 0.0;
        config.runtime.retry_sleep_cap_secs = 0.0;
        config
    }

    /// [`Self::config`] with one MCP server entry so the tool manager gets connected.
    pub fn config_with_mcp(&self) -> AgentConfig {
        let mut config = self.config();
        config.mcp.servers.insert(
            "files".to_string(),
            McpServerConfig {
                command: "files-mcp".to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
                timeout_secs: 5,
            },
        );
        config
    }
}

/// Every event of a run's log.
pub fn run_events(result: &RunResult) -> Result<Vec<EventRecord>> {
    read_events(&result.events_path)
}

/// Event types of a run's log, in order.
pub fn event_types(result: &RunResult) -> Result<Vec<EventType>> {
    Ok(run_events(result)?
        .into_iter()
        .map(|record| record.event_type)
        .collect())
}

/// Payloads of every event of `event_type`.
pub fn payloads(result: &RunResult, event_type: EventType) -> Result<Vec<Map<String, Value>>> {
    Ok(run_events(result)?
        .into_iter()
        .filter(|record| record.event_type == event_type)
        .map(|record| record.payload)
        .collect())
}
