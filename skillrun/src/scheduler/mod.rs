//! Turn scheduler: run setup, the bounded turn loop, and run results.
//!
//! A run walks `setup -> turn* -> finished | failed`. Every transition is
//! recorded on the run's event log; failures are returned as
//! [`RunResult`]s carrying a [`FailureReason`], never as `Err`. An `Err` from
//! [`Scheduler::run`] means the run directory or event log itself could not be
//! written.

mod actions;
mod invoke;
mod synthesis;

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::core::decoder::{decode_model_decision, make_finish_decision, raw_action_types};
use crate::core::handoff::{
    HandoffOutcome, MAX_RECOVERY_COMMANDS, SelfHandoffState, build_recovery_decision,
};
use crate::core::payload::summarize_text;
use crate::core::prefilter::{prefilter, resolve_candidates};
use crate::core::redaction::Scrubber;
use crate::core::types::{
    ActionType, FailureReason, ModelDecision, ResponseKind, RunStatus, SkillCandidate,
    StepExecutionResult,
};
use crate::io::config::{AgentConfig, Provider, StructuredOutputMode};
use crate::io::events::{EventBus, EventRecord, EventType};
use crate::io::executor::CommandExecutor;
use crate::io::prompt::{PromptBuild, PromptInputs, build_decision_prompt, prompt_hash};
use crate::io::run_store::{DRY_RUN_PROMPT_FILE, FINAL_SUMMARY_FILE, RunStore, generate_run_id};
use crate::io::signals::InterruptFlag;
use crate::io::transcript::{AttemptStatus, CallSite, TranscriptRecord, TranscriptSink};
use crate::llm::{ModelProvider, decision_tool};
use crate::mcp::{ToolInfo, ToolManager};
use crate::skills::disclosure::{DisclosedContext, DisclosureAccumulator, DisclosureEngine};
use crate::skills::parser::Skill;
use crate::skills::registry::{PreparedSkills, prepare_skills, resolve_skills_dir};

use self::actions::{ActionEnv, execute_actions};
use self::invoke::{ModelCall, invoke_with_retry};
use self::synthesis::synthesize_final_answer;

const EMPTY_DECISION_REASON: &str = "No actions returned; ending run";
const DECODE_FAILED_REASON: &str =
    "Mapped to response because decoding failed before action normalization.";
const FINAL_SUMMARY_PREVIEW_CHARS: usize = 1000;

/// Observer for every event a run records.
pub type ProgressCallback = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// One task to run. `None` fields fall back to the config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub task: String,
    pub skills_dir: Option<PathBuf>,
    pub provider: Option<Provider>,
    pub dry_run: bool,
    pub max_turns: Option<u32>,
    /// Serialized summaries of earlier runs in the same chat session.
    pub session_context: Option<String>,
    /// Reuse an existing run directory (chat sessions).
    pub run_id: Option<String>,
    pub artifact_prefix: Option<String>,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub failure: Option<FailureReason>,
    pub message: String,
    pub run_dir: PathBuf,
    pub events_path: PathBuf,
    pub transcript_path: Option<PathBuf>,
    pub final_summary_path: Option<PathBuf>,
    pub final_summary: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Drives runs against injected collaborators.
///
/// The tool manager is only used when MCP is enabled and servers are
/// configured; it is connected at setup and closed when the run ends.
pub struct Scheduler<'a> {
    config: &'a AgentConfig,
    provider: &'a dyn ModelProvider,
    executor: &'a dyn CommandExecutor,
    tools: Option<&'a mut dyn ToolManager>,
    prepared: Option<&'a PreparedSkills>,
    interrupt: InterruptFlag,
    on_event: Option<ProgressCallback>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a AgentConfig,
        provider: &'a dyn ModelProvider,
        executor: &'a dyn CommandExecutor,
    ) -> Self {
        Self {
            config,
            provider,
            executor,
            tools: None,
            prepared: None,
            interrupt: InterruptFlag::new(),
            on_event: None,
        }
    }

    pub fn with_tool_manager(mut self, tools: &'a mut dyn ToolManager) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Skills loaded ahead of time. Ignored when a run asks for another directory.
    pub fn with_prepared_skills(mut self, prepared: &'a PreparedSkills) -> Self {
        self.prepared = Some(prepared);
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

    /// Execute one run to completion.
    #[instrument(skip_all, fields(dry_run = request.dry_run))]
    pub fn run(&mut self, request: &RunRequest) -> Result<RunResult> {
        let config = self.config;
        let run_id = request.run_id.clone().unwrap_or_else(generate_run_id);
        let store = RunStore::create(
            &config.logging.jsonl_dir,
            &run_id,
            request.artifact_prefix.as_deref(),
        )?;
        let scrubber = config.logging.scrubber();
        let mut events = EventBus::new(store.events_path(), &run_id, scrubber);
        if let Some(callback) = &self.on_event {
            let callback = Arc::clone(callback);
            events = events.with_callback(Box::new(move |record| callback(record)));
        }
        let transcript = config.logging.llm_transcript_enabled.then(|| {
            TranscriptSink::new(
                store.run_dir().join(&config.logging.llm_transcript_filename),
                scrubber,
            )
        });
        let ctx = RunContext {
            config,
            llm: self.provider,
            store,
            events,
            transcript,
            scrubber,
            provider: request.provider.unwrap_or(config.model.provider),
            task: &request.task,
        };
        info!(run_id = %run_id, provider = ctx.provider.as_str(), "run started");

        let mut connected = false;
        let outcome = self.execute(&ctx, request, &mut connected);
        if connected && let Some(tools) = self.tools.as_deref_mut() {
            if let Err(err) = tools.close() {
                warn!(err = %format!("{err:#}"), "closing MCP servers failed");
            }
            ctx.emit(EventType::McpServersDisconnected, json!({}))?;
        }
        outcome
    }

    fn execute(
        &mut self,
        ctx: &RunContext<'_>,
        request: &RunRequest,
        connected: &mut bool,
    ) -> Result<RunResult> {
        let config = ctx.config;
        let max_turns = request.max_turns.unwrap_or(config.runtime.max_turns);
        ctx.emit(
            EventType::RunStarted,
            json!({
                "task": request.task,
                "provider": ctx.provider.as_str(),
                "dry_run": request.dry_run,
                "max_turns": max_turns,
            }),
        )?;

        let requested_dir = resolve_skills_dir(
            request
                .skills_dir
                .as_deref()
                .unwrap_or(&config.skills.dir),
        )?;
        let loaded;
        let (prepared, loaded_from_cache) = match self.prepared {
            Some(prepared) if prepared.skills_dir == requested_dir => (prepared, true),
            cached => {
                if let Some(cached) = cached {
                    ctx.emit(
                        EventType::PreparedSkillsIgnored,
                        json!({
                            "reason": "skills_dir_mismatch",
                            "prepared_skills_dir": cached.skills_dir,
                            "requested_skills_dir": requested_dir,
                        }),
                    )?;
                }
                loaded = prepare_skills(&requested_dir)?;
                (&loaded, false)
            }
        };
        for failure in &prepared.parse_failures {
            ctx.emit(
                EventType::SkillParseFailed,
                json!({"skill_dir": failure.skill_dir, "error": failure.error}),
            )?;
        }
        ctx.emit(
            EventType::SkillCatalogLoaded,
            json!({
                "skills_count": prepared.skills.len(),
                "skills_dir": prepared.skills_dir,
                "loaded_from_cache": loaded_from_cache,
            }),
        )?;
        if prepared.skills.is_empty() {
            return ctx.fail(
                FailureReason::NoSkillsFound,
                json!({"skills_dir": prepared.skills_dir}),
            );
        }

        let entries = prepared.prefilter_entries();
        let ranked = prefilter(
            &request.task,
            &entries,
            config.skills.prefilter_top_k,
            config.skills.prefilter_min_score,
        );
        let Some(candidates) = resolve_candidates(
            ranked,
            &entries,
            config.skills.prefilter_top_k,
            config.skills.prefilter_zero_candidate_strategy,
        ) else {
            return ctx.fail(
                FailureReason::PrefilterZeroCandidates,
                json!({"min_score": config.skills.prefilter_min_score}),
            );
        };
        ctx.emit(
            EventType::SkillPrefilterCompleted,
            json!({"candidate_count": candidates.len(), "candidates": candidates}),
        )?;

        let mut state = RunState {
            prepared,
            candidates,
            session_context: request.session_context.as_deref(),
            engine: DisclosureEngine::new(
                config.skills.disclosure_max_reference_bytes,
                config.skills.disclosure_max_reference_tokens,
            ),
            accumulator: DisclosureAccumulator::default(),
            disclosed_skills: BTreeSet::new(),
            primary_skill: None,
            step_results: Vec::new(),
            handoff: SelfHandoffState::default(),
            mcp_tools: Vec::new(),
            mcp_connected: false,
            rg_available: self.executor.program_available("rg"),
        };
        if let Some(skill) = state
            .candidates
            .first()
            .and_then(|candidate| prepared.by_name(&candidate.skill_name))
        {
            let disclosed = state.engine.stage1(skill, None);
            state.accumulator.merge(&disclosed);
            state.disclosed_skills.insert(skill.name().to_string());
            state.primary_skill = Some(skill.name().to_string());
            ctx.emit_disclosure(skill.name(), &disclosed)?;
        }

        if config.mcp.enabled
            && !config.mcp.servers.is_empty()
            && let Some(tools) = self.tools.as_deref_mut()
        {
            match tools.connect(&config.mcp.servers) {
                Ok(found) => {
                    *connected = true;
                    state.mcp_connected = true;
                    let listed: Vec<Value> = found
                        .iter()
                        .map(|tool| json!({"name": tool.name, "server": tool.server}))
                        .collect();
                    ctx.emit(
                        EventType::McpServersConnected,
                        json!({
                            "server_count": config.mcp.servers.len(),
                            "tool_count": found.len(),
                            "tools": listed,
                        }),
                    )?;
                    state.mcp_tools = found;
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(%error, "MCP connection failed; continuing without tools");
                    if let Err(close_err) = tools.close() {
                        warn!(err = %format!("{close_err:#}"), "closing MCP servers failed");
                    }
                    ctx.emit(EventType::McpConnectionFailed, json!({"error": error}))?;
                }
            }
        }

        if request.dry_run {
            let native = config.model.structured_output_mode.uses_native_tools();
            let build = compose_prompt(ctx, &state, None, native)?;
            let prompt_artifact = ctx.store.write_artifact(DRY_RUN_PROMPT_FILE, &build.prompt)?;
            ctx.emit(
                EventType::RunFinished,
                json!({"mode": "dry_run", "prompt_artifact": prompt_artifact}),
            )?;
            return Ok(ctx.result(RunStatus::Success, None, "Dry run complete"));
        }

        if !self.provider.is_configured(ctx.provider) {
            return ctx.fail(
                FailureReason::MissingProviderApiKey,
                json!({"provider": ctx.provider.as_str()}),
            );
        }

        for turn in 1..=max_turns {
            if self.interrupt.is_requested() {
                let signal = self
                    .interrupt
                    .signal_name()
                    .unwrap_or_else(|| "unknown".to_string());
                ctx.emit(
                    EventType::SignalReceived,
                    json!({"signal": signal, "turn_index": turn}),
                )?;
                ctx.emit(
                    EventType::GracefulShutdownStarted,
                    json!({"reason": "signal"}),
                )?;
                return ctx.fail(
                    FailureReason::Interrupted,
                    json!({"signal": signal, "turn_index": turn}),
                );
            }
            if let ControlFlow::Break(result) = self.run_turn(ctx, &mut state, turn)? {
                return Ok(result);
            }
        }
        ctx.fail(
            FailureReason::MaxTurnsExceeded,
            json!({"max_turns": max_turns}),
        )
    }

    #[instrument(skip_all, fields(turn = turn))]
    fn run_turn(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState<'_>,
        turn: u32,
    ) -> Result<ControlFlow<RunResult>> {
        let config = ctx.config;
        if let Some(blocked) = state.handoff.blocked_skill.as_deref() {
            ctx.emit(
                EventType::SelfHandoffConstraintApplied,
                json!({"turn_index": turn, "blocked_skill": blocked}),
            )?;
        }

        let mode = config.model.structured_output_mode;
        let native = mode.uses_native_tools();
        let tools = if native { vec![decision_tool()] } else { Vec::new() };
        let disclosed_paths = state.accumulator.paths();
        let mut build = compose_prompt(ctx, state, Some(turn), native)?;
        let mut outcome = invoke_with_retry(
            ctx,
            &ModelCall::new(CallSite::Decision, turn, &build, config.model.max_tokens)
                .with_disclosed_paths(&disclosed_paths)
                .with_tools(&tools, mode.forces_tool_use()),
            1,
        )?;
        if outcome.completion.is_none()
            && native
            && mode == StructuredOutputMode::NativeWithJsonFallback
        {
            ctx.emit(
                EventType::NativeToolFallback,
                json!({
                    "turn_index": turn,
                    "reason": outcome.error.as_deref().unwrap_or("unknown"),
                }),
            )?;
            build = compose_prompt(ctx, state, Some(turn), false)?;
            outcome = invoke_with_retry(
                ctx,
                &ModelCall::new(CallSite::Decision, turn, &build, config.model.max_tokens)
                    .with_disclosed_paths(&disclosed_paths),
                outcome.record.attempt + 1,
            )?;
        }

        let Some(completion) = outcome.completion else {
            return ctx
                .fail(
                    FailureReason::LlmRequestFailed,
                    json!({
                        "turn_index": turn,
                        "error": outcome.error.unwrap_or_default(),
                    }),
                )
                .map(ControlFlow::Break);
        };
        let mut record = outcome.record;
        record.raw_action_types = raw_action_types(&completion.data);

        let decoded = match decode_model_decision(&completion.data, &state.prepared.tables) {
            Ok(decision) => decision,
            Err(err) => {
                let error = err.to_string();
                warn!(%error, "model response could not be decoded");
                record.status = AttemptStatus::DecodeFailed;
                record.error = Some(error.clone());
                record.response_kind_reason = Some(DECODE_FAILED_REASON.to_string());
                ctx.write_transcript(&record)?;
                return ctx
                    .fail(
                        FailureReason::DecodeFailed,
                        json!({"turn_index": turn, "error": error}),
                    )
                    .map(ControlFlow::Break);
            }
        };
        ctx.emit(
            EventType::LlmDecisionDecoded,
            json!({
                "turn_index": turn,
                "selected_skill": decoded.selected_skill(),
                "planned_actions": action_type_names(&decoded),
                "required_disclosure_paths": decoded.required_disclosure_paths,
            }),
        )?;
        let mut decision = if decoded.planned_actions.is_empty() {
            make_finish_decision(EMPTY_DECISION_REASON)
        } else {
            decoded
        };

        let threshold = config.runtime.self_handoff_recovery_threshold;
        if state.handoff.needs_recovery(&decision, threshold) {
            let skill = decision.selected_skill().unwrap_or_default().to_string();
            let commands = state
                .prepared
                .tables
                .default_commands(&skill, MAX_RECOVERY_COMMANDS);
            decision = build_recovery_decision(&decision, &commands, state.rg_available);
            info!(skill = %skill, "self-handoff replaced by recovery decision");
            ctx.emit(
                EventType::SelfHandoffRecoveryApplied,
                json!({
                    "turn_index": turn,
                    "selected_skill": skill,
                    "recovery_action_types": action_type_names(&decision),
                }),
            )?;
        }

        let action_types = decision.action_types();
        let kind = ResponseKind::classify(&action_types);
        record.decode_success = true;
        record.selected_skill = decision.selected_skill().map(str::to_string);
        record.planned_action_types = action_type_names(&decision);
        record.required_disclosure_paths = decision.required_disclosure_paths.clone();
        record.response_kind = kind;
        record.response_kind_reason = Some(kind.reason(&action_types).to_string());
        record.finish_summary = decision.finish_summary().map(str::to_string);
        ctx.write_transcript(&record)?;

        ctx.emit(
            EventType::SkillInvocationStarted,
            json!({"turn_index": turn, "selected_skill": decision.selected_skill()}),
        )?;
        let env = ActionEnv {
            executor: self.executor,
            mcp_tools: &state.mcp_tools,
            rg_available: state.rg_available,
        };
        let tool_manager = if state.mcp_connected {
            self.tools.as_deref_mut()
        } else {
            None
        };
        let execution = execute_actions(ctx, &env, tool_manager, turn, &decision.planned_actions)?;
        ctx.emit(
            EventType::SkillInvocationFinished,
            json!({"turn_index": turn, "step_results": execution.results}),
        )?;
        let step_failed = execution.results.iter().any(StepExecutionResult::is_failed);
        state.step_results.extend(execution.results.iter().cloned());

        match state.handoff.record(&decision, threshold) {
            HandoffOutcome::Cleared => {}
            HandoffOutcome::Detected {
                skill,
                consecutive_turns,
            } => {
                ctx.emit(
                    EventType::SelfHandoffDetected,
                    json!({
                        "turn_index": turn,
                        "selected_skill": skill,
                        "count": consecutive_turns,
                    }),
                )?;
            }
            HandoffOutcome::Loop {
                skill,
                consecutive_turns,
            } => {
                return ctx
                    .fail(
                        FailureReason::SelfHandoffLoop,
                        json!({
                            "turn_index": turn,
                            "selected_skill": skill,
                            "count": consecutive_turns,
                        }),
                    )
                    .map(ControlFlow::Break);
            }
        }

        disclose_after_turn(ctx, state, &decision, &execution.results)?;

        if execution.finished {
            let preliminary = decision.finish_summary().map(str::to_string);
            let synthesized =
                synthesize_final_answer(ctx, &state.step_results, turn, preliminary.as_deref())?;
            return finish_run(ctx, turn, synthesized.or(preliminary)).map(ControlFlow::Break);
        }
        if step_failed {
            return ctx
                .fail(
                    FailureReason::StepExecutionFailed,
                    json!({"turn_index": turn}),
                )
                .map(ControlFlow::Break);
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Mutable state scoped to one run.
struct RunState<'r> {
    prepared: &'r PreparedSkills,
    candidates: Vec<SkillCandidate>,
    session_context: Option<&'r str>,
    engine: DisclosureEngine,
    accumulator: DisclosureAccumulator,
    /// Skills whose stage 1 content has been disclosed.
    disclosed_skills: BTreeSet<String>,
    /// Skill whose disclosure keys carry no namespace.
    primary_skill: Option<String>,
    step_results: Vec<StepExecutionResult>,
    handoff: SelfHandoffState,
    mcp_tools: Vec<ToolInfo>,
    mcp_connected: bool,
    rg_available: bool,
}

/// Sinks and settings shared by every part of one run.
struct RunContext<'r> {
    config: &'r AgentConfig,
    llm: &'r dyn ModelProvider,
    store: RunStore,
    events: EventBus,
    transcript: Option<TranscriptSink>,
    scrubber: Scrubber,
    provider: Provider,
    task: &'r str,
}

impl RunContext<'_> {
    fn emit(&self, event_type: EventType, payload: Value) -> Result<()> {
        self.events.emit(event_type, payload).map(|_| ())
    }

    /// Append a transcript block. Write failures are reported, never fatal.
    fn write_transcript(&self, record: &TranscriptRecord) -> Result<()> {
        let Some(sink) = &self.transcript else {
            return Ok(());
        };
        if let Err(err) = sink.write(record) {
            let error = format!("{err:#}");
            warn!(%error, "transcript write failed");
            self.emit(
                EventType::LlmTranscriptWriteFailed,
                json!({
                    "turn_index": record.turn_index,
                    "attempt": record.attempt,
                    "error": error,
                }),
            )?;
        }
        Ok(())
    }

    fn emit_disclosure(&self, skill: &str, disclosed: &DisclosedContext) -> Result<()> {
        self.emit(
            EventType::SkillDisclosureLoaded,
            json!({
                "skill": skill,
                "stage": disclosed.stage,
                "paths": disclosed.paths(),
                "total_bytes": disclosed.total_bytes,
                "total_tokens": disclosed.total_tokens,
            }),
        )
    }

    fn result(&self, status: RunStatus, failure: Option<FailureReason>, message: &str) -> RunResult {
        RunResult {
            run_id: self.store.run_id().to_string(),
            status,
            failure,
            message: message.to_string(),
            run_dir: self.store.run_dir().to_path_buf(),
            events_path: self.events.path().to_path_buf(),
            transcript_path: self.transcript.as_ref().map(|sink| sink.path().to_path_buf()),
            final_summary_path: None,
            final_summary: None,
        }
    }

    /// Record `run_failed` and build the failed result.
    fn fail(&self, reason: FailureReason, details: Value) -> Result<RunResult> {
        let mut payload = match details {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("reason".to_string(), json!(reason.as_str()));
        warn!(reason = %reason, "run failed");
        self.emit(EventType::RunFailed, Value::Object(payload))?;
        Ok(self.result(RunStatus::Failed, Some(reason), reason.message()))
    }
}

fn action_type_names(decision: &ModelDecision) -> Vec<String> {
    decision
        .action_types()
        .iter()
        .map(|kind| kind.as_str().to_string())
        .collect()
}

/// Adds `turn_index` to an object payload when the prompt belongs to a turn.
fn with_turn(mut payload: Value, turn: Option<u32>) -> Value {
    if let (Some(turn), Some(map)) = (turn, payload.as_object_mut()) {
        map.insert("turn_index".to_string(), json!(turn));
    }
    payload
}

fn compose_prompt(
    ctx: &RunContext<'_>,
    state: &RunState<'_>,
    turn: Option<u32>,
    use_native_tools: bool,
) -> Result<PromptBuild> {
    let inputs = PromptInputs {
        task: ctx.task,
        candidates: &state.candidates,
        catalog: &state.prepared.catalog,
        disclosed: state.accumulator.snippets(),
        step_results: &state.step_results,
        session_context: state.session_context,
        blocked_skill: state.handoff.blocked_skill.as_deref(),
        mcp_tools: &state.mcp_tools,
        use_native_tools,
    };
    let build = build_decision_prompt(
        &inputs,
        ctx.config.model.max_context_tokens,
        ctx.config.model.response_headroom_tokens,
    )?;
    let mut budget = serde_json::to_value(build.budget)?;
    if let Some(map) = budget.as_object_mut() {
        if !build.dropped_sections.is_empty() {
            map.insert("dropped_sections".to_string(), json!(build.dropped_sections));
        }
        if !build.omitted_disclosures.is_empty() {
            map.insert(
                "omitted_disclosures".to_string(),
                json!(build.omitted_disclosures),
            );
        }
    }
    ctx.emit(EventType::PromptBudgetComputed, with_turn(budget, turn))?;
    ctx.emit(
        EventType::PromptComposed,
        with_turn(
            json!({
                "prompt_hash": prompt_hash(&build.prompt),
                "estimated_input_tokens": build.estimated_input_tokens,
            }),
            turn,
        ),
    )?;
    Ok(build)
}

/// Every skill but the primary one gets its name on its disclosure keys.
fn disclosure_namespace<'s>(primary: Option<&str>, skill: &'s Skill) -> Option<&'s str> {
    (primary != Some(skill.name())).then(|| skill.name())
}

fn is_scripts_request(path: &str) -> bool {
    matches!(path.trim(), "scripts" | "scripts/")
}

/// Stage 2/3 for paths the decision asked for, stage 1 for newly handed-off skills.
fn disclose_after_turn(
    ctx: &RunContext<'_>,
    state: &mut RunState<'_>,
    decision: &ModelDecision,
    results: &[StepExecutionResult],
) -> Result<()> {
    let prepared = state.prepared;
    if let Some(skill) = decision
        .selected_skill()
        .and_then(|name| prepared.by_name(name))
    {
        let namespace = disclosure_namespace(state.primary_skill.as_deref(), skill);
        let (scripts, paths): (Vec<String>, Vec<String>) = decision
            .required_disclosure_paths
            .iter()
            .cloned()
            .partition(|path| is_scripts_request(path));
        if !paths.is_empty() {
            let disclosed = state.engine.stage2(skill, &paths, namespace);
            state.accumulator.merge(&disclosed);
            ctx.emit_disclosure(skill.name(), &disclosed)?;
        }
        if !scripts.is_empty() {
            let disclosed = state.engine.stage3(skill, namespace);
            state.accumulator.merge(&disclosed);
            ctx.emit_disclosure(skill.name(), &disclosed)?;
        }
    }

    let handoffs = decision
        .planned_actions
        .iter()
        .zip(results)
        .filter(|(action, result)| {
            action.action_type == ActionType::CallSkill && !result.is_failed()
        })
        .filter_map(|(action, _)| action.param_str("skill_name"));
    for target in handoffs {
        if state.disclosed_skills.contains(target) {
            continue;
        }
        let Some(skill) = prepared.by_name(target) else {
            continue;
        };
        let namespace = disclosure_namespace(state.primary_skill.as_deref(), skill);
        let disclosed = state.engine.stage1(skill, namespace);
        state.accumulator.merge(&disclosed);
        state.disclosed_skills.insert(skill.name().to_string());
        ctx.emit_disclosure(skill.name(), &disclosed)?;
    }
    Ok(())
}

fn finish_run(ctx: &RunContext<'_>, turn: u32, summary: Option<String>) -> Result<RunResult> {
    let summary = summary
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    let summary_path = match &summary {
        Some(text) => Some(
            ctx.store
                .write_artifact(FINAL_SUMMARY_FILE, &format!("# Final Summary\n\n{text}\n"))?,
        ),
        None => None,
    };
    ctx.emit(
        EventType::RunFinished,
        json!({
            "turn_index": turn,
            "final_summary": summary
                .as_deref()
                .map(|text| summarize_text(text, FINAL_SUMMARY_PREVIEW_CHARS)),
            "final_summary_artifact": summary_path,
        }),
    )?;
    info!(turn, "run completed");
    Ok(RunResult {
        final_summary_path: summary_path,
        final_summary: summary,
        ..ctx.result(RunStatus::Success, None, "Run completed")
    })
}
