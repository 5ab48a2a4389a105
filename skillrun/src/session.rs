//! Chat sessions: tasks run back to back into one run directory.
//!
//! Each task gets its own artifact prefix (`task_001_`, `task_002_`, ...) and
//! shares the session's event log. A bounded [`SessionMemory`] of earlier
//! results is fed into every later prompt.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::budget::estimate_tokens;
use crate::core::payload::summarize_text;
use crate::core::types::RunStatus;
use crate::io::config::{AgentConfig, Provider, SessionConfig};
use crate::io::executor::CommandExecutor;
use crate::io::run_store::generate_run_id;
use crate::io::signals::InterruptFlag;
use crate::llm::ModelProvider;
use crate::mcp::ToolManager;
use crate::scheduler::{ProgressCallback, RunRequest, RunResult, Scheduler};
use crate::skills::registry::{PreparedSkills, prepare_skills};

const NO_SUMMARY: &str = "(no summary)";
const MIN_CLIPPED_SUMMARY_CHARS: usize = 32;

/// One finished task as remembered by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub task: String,
    pub run_id: String,
    pub status: RunStatus,
    pub summary: String,
    pub timestamp: String,
}

/// Most recent task results, bounded by count and by prompt tokens.
#[derive(Debug, Clone)]
pub struct SessionMemory {
    limits: SessionConfig,
    entries: VecDeque<SessionEntry>,
}

impl SessionMemory {
    pub fn new(limits: SessionConfig) -> Self {
        Self {
            limits,
            entries: VecDeque::new(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &SessionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remember a finished task, evicting the oldest past `max_entries`.
    pub fn append(&mut self, task: &str, run_id: &str, status: RunStatus, summary: Option<&str>) {
        let summary = summary.map(str::trim).filter(|text| !text.is_empty());
        self.entries.push_back(SessionEntry {
            task: task.trim().to_string(),
            run_id: run_id.to_string(),
            status,
            summary: summarize_text(
                summary.unwrap_or(NO_SUMMARY),
                self.limits.max_summary_chars,
            ),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        while self.entries.len() > self.limits.max_entries {
            self.entries.pop_front();
        }
    }

    /// Entries that fit `max_context_tokens`, oldest dropped first.
    ///
    /// A lone oversized entry has its summary halved (never below 32 chars)
    /// until it fits; if it still cannot fit the context is empty.
    pub fn build_context(&self) -> Vec<SessionEntry> {
        let budget = self.limits.max_context_tokens;
        let mut records: Vec<SessionEntry> = self.entries.iter().cloned().collect();
        while records.len() > 1 && estimate_records(&records) > budget {
            records.remove(0);
        }
        if records.len() == 1 {
            while estimate_records(&records) > budget {
                let current = records[0].summary.chars().count();
                let target = (current / 2).max(MIN_CLIPPED_SUMMARY_CHARS);
                if target >= current {
                    debug!(budget, "session context cannot fit its newest entry");
                    return Vec::new();
                }
                records[0].summary = records[0].summary.chars().take(target).collect();
            }
        }
        records
    }

    /// The context as the JSON text embedded in prompts. `None` when empty.
    pub fn render_context(&self) -> Option<String> {
        let records = self.build_context();
        if records.is_empty() {
            return None;
        }
        serde_json::to_string(&records).ok()
    }
}

fn estimate_records(records: &[SessionEntry]) -> usize {
    serde_json::to_string(records).map_or(usize::MAX, |text| estimate_tokens(&text))
}

/// Per-session overrides applied to every task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub skills_dir: Option<PathBuf>,
    pub provider: Option<Provider>,
    pub max_turns: Option<u32>,
    /// Re-read the skills directory before every task.
    pub reload_skills_each_task: bool,
}

/// Runs tasks sequentially, sharing one run directory and a session memory.
pub struct ChatSession<'a> {
    config: &'a AgentConfig,
    provider: &'a dyn ModelProvider,
    executor: &'a dyn CommandExecutor,
    tools: Option<&'a mut dyn ToolManager>,
    interrupt: InterruptFlag,
    on_event: Option<ProgressCallback>,
    options: SessionOptions,
    run_id: String,
    task_count: u32,
    prepared: Option<PreparedSkills>,
    memory: SessionMemory,
}

impl<'a> ChatSession<'a> {
    pub fn new(
        config: &'a AgentConfig,
        provider: &'a dyn ModelProvider,
        executor: &'a dyn CommandExecutor,
        options: SessionOptions,
    ) -> Self {
        Self {
            config,
            provider,
            executor,
            tools: None,
            interrupt: InterruptFlag::new(),
            on_event: None,
            options,
            run_id: generate_run_id(),
            task_count: 0,
            prepared: None,
            memory: SessionMemory::new(config.session.clone()),
        }
    }

    pub fn with_tool_manager(mut self, tools: &'a mut dyn ToolManager) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    /// Run one task and remember its outcome.
    ///
    /// An interrupt only stops the task it arrived during; the flag is
    /// cleared before each new task starts.
    pub fn run_task(&mut self, task: &str) -> Result<RunResult> {
        self.task_count += 1;
        self.interrupt.clear();
        if self.prepared.is_none() || self.options.reload_skills_each_task {
            let dir = self
                .options
                .skills_dir
                .as_deref()
                .unwrap_or(&self.config.skills.dir);
            self.prepared = Some(prepare_skills(dir)?);
        }
        let request = RunRequest {
            task: task.to_string(),
            skills_dir: self.options.skills_dir.clone(),
            provider: self.options.provider,
            dry_run: false,
            max_turns: self.options.max_turns,
            session_context: self.memory.render_context(),
            run_id: Some(self.run_id.clone()),
            artifact_prefix: Some(format!("task_{:03}_", self.task_count)),
        };
        info!(task_number = self.task_count, run_id = %self.run_id, "session task started");

        let mut scheduler = Scheduler::new(self.config, self.provider, self.executor)
            .with_interrupt(self.interrupt.clone());
        if let Some(prepared) = &self.prepared {
            scheduler = scheduler.with_prepared_skills(prepared);
        }
        if let Some(tools) = self.tools.as_deref_mut() {
            scheduler = scheduler.with_tool_manager(tools);
        }
        if let Some(callback) = &self.on_event {
            scheduler = scheduler.with_progress(Arc::clone(callback));
        }
        let result = scheduler.run(&request)?;

        let summary = result.final_summary.as_deref().unwrap_or(&result.message);
        self.memory
            .append(task, &result.run_id, result.status, Some(summary));
        Ok(result)
    }
}
