//! End-to-end scheduler runs against scripted model and shell collaborators.
//!
//! Each test writes a skills tree into a temp workspace, queues model replies
//! and command outcomes, and checks the run result plus the event log and
//! transcript it leaves behind.

use std::fs;

use serde_json::{Value, json};
use skillrun::core::prefilter::ZeroCandidateStrategy;
use skillrun::core::types::{FailureReason, RunStatus};
use skillrun::io::config::{StepFailurePolicy, StructuredOutputMode};
use skillrun::io::events::EventType;
use skillrun::io::run_store::DRY_RUN_PROMPT_FILE;
use skillrun::io::signals::InterruptFlag;
use skillrun::io::transcript::replay_transcript;
use skillrun::llm::ProviderError;
use skillrun::scheduler::{RunRequest, Scheduler};
use skillrun::test_support::{
    ScriptedExec, ScriptedExecutor, ScriptedProvider, TestWorkspace, command_reply, event_types,
    finish_reply, payloads, reply,
};

fn demo_workspace() -> TestWorkspace {
    let workspace = TestWorkspace::new().expect("workspace");
    workspace
        .write_skill("demo", "Inventory files in the workspace", "")
        .expect("skill");
    workspace
}

/// Verifies a dry run composes and stores the prompt without calling the model.
#[test]
fn dry_run_writes_prompt_without_model_call() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::unconfigured();
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest {
            dry_run: true,
            ..RunRequest::new("inventory files")
        })
        .expect("run");

    assert_eq!(result.status, RunStatus::Success);
    assert!(provider.requests().is_empty());
    let prompt = fs::read_to_string(result.run_dir.join(DRY_RUN_PROMPT_FILE)).expect("prompt");
    assert!(prompt.contains("inventory files"));
    assert!(prompt.contains("section:Purpose"));
    let types = event_types(&result).expect("events");
    assert_eq!(types.first(), Some(&EventType::RunStarted));
    assert_eq!(types.last(), Some(&EventType::RunFinished));
    assert!(!types.contains(&EventType::LlmRequestSent));
}

/// Verifies a finish decision ends the run and writes the final summary file.
#[test]
fn finish_decision_writes_final_summary() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![reply(json!({
        "planned_actions": [{"type": "finish", "params": {"summary": "done"}}]
    }))]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert_eq!(result.final_summary.as_deref(), Some("done"));
    let summary_path = result.final_summary_path.clone().expect("summary path");
    assert_eq!(
        fs::read_to_string(summary_path).expect("summary"),
        "# Final Summary\n\ndone\n"
    );
    let finished = payloads(&result, EventType::RunFinished).expect("events");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["final_summary"], "done");
    assert_eq!(provider.requests().len(), 1);
}

/// Verifies a retryable failure is retried and both attempts reach the transcript.
#[test]
fn retryable_request_failure_is_retried() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.runtime.max_llm_retries = 1;
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::Connection("connection reset".to_string())),
        finish_reply("done after retry"),
    ]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let attempts: Vec<u32> = provider.requests().iter().map(|request| request.attempt).collect();
    assert_eq!(attempts, [1, 2]);

    let blocks = replay_transcript(&result.transcript_path.clone().expect("transcript"))
        .expect("replay");
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].contains("Status: request_failed"));
    assert!(blocks[0].contains("Retryable: true"));
    assert!(blocks[1].contains("Status: success"));
    assert!(blocks[1].contains("Attempt: 2"));

    let types = event_types(&result).expect("events");
    assert!(types.contains(&EventType::LlmRetryScheduled));
}

/// Verifies retries stop after the configured limit and surface the last error.
#[test]
fn retries_stop_at_the_configured_limit() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.runtime.max_llm_retries = 2;
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::Status {
            status: 503,
            body: "overloaded".to_string(),
        }),
        Err(ProviderError::Status {
            status: 503,
            body: "overloaded".to_string(),
        }),
        Err(ProviderError::Status {
            status: 503,
            body: "overloaded".to_string(),
        }),
        finish_reply("never reached"),
    ]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::LlmRequestFailed));
    assert_eq!(provider.requests().len(), 3);
    assert_eq!(provider.remaining(), 1);
    assert_eq!(
        payloads(&result, EventType::LlmRetryScheduled)
            .expect("events")
            .len(),
        2
    );
}

/// Verifies an auth failure fails the run on the first attempt.
#[test]
fn non_retryable_failure_is_not_retried() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::Status {
            status: 401,
            body: "bad key".to_string(),
        }),
        finish_reply("never reached"),
    ]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::LlmRequestFailed));
    assert_eq!(provider.requests().len(), 1);
    let failed = payloads(&result, EventType::LlmRequestFailed).expect("events");
    assert_eq!(failed[0]["retryable"], false);
}

/// Verifies non-JSON output fails the run and leaves one decode_failed attempt.
#[test]
fn non_json_response_fails_decoding() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![reply(json!("not-json-response"))]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failure, Some(FailureReason::DecodeFailed));
    let blocks = replay_transcript(&result.transcript_path.clone().expect("transcript"))
        .expect("replay");
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].contains("Status: decode_failed"));
    assert!(blocks[0].contains("not-json-response"));
    let failed = payloads(&result, EventType::RunFailed).expect("events");
    assert_eq!(failed[0]["reason"], "decode_failed");
}

/// Verifies the second pure self-handoff is replaced by a finish-only recovery.
#[test]
fn repeated_self_handoff_recovers_with_finish() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let handoff = || {
        reply(json!({
            "selected_skill": "demo",
            "planned_actions": [{"type": "call_skill", "params": {"skill_name": "demo"}}]
        }))
    };
    let provider = ScriptedProvider::new(vec![handoff(), handoff(), handoff()]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert_eq!(provider.requests().len(), 2);
    assert!(executor.commands().is_empty());
    assert_eq!(
        result.final_summary.as_deref(),
        Some("Recovered from repeated self-handoff loop.")
    );

    let recovery = payloads(&result, EventType::SelfHandoffRecoveryApplied).expect("events");
    assert_eq!(recovery.len(), 1);
    assert_eq!(recovery[0]["turn_index"], 2);
    assert_eq!(recovery[0]["recovery_action_types"], json!(["finish"]));
    let types = event_types(&result).expect("events");
    assert!(types.contains(&EventType::SelfHandoffDetected));
    assert!(types.contains(&EventType::SelfHandoffConstraintApplied));
    assert!(provider.requests()[1].prompt.contains("CONSTRAINT:"));
}

/// Verifies recovery runs the blocked skill's default commands before finishing.
#[test]
fn recovery_runs_the_skill_default_commands() {
    let workspace = TestWorkspace::new().expect("workspace");
    workspace
        .write_skill(
            "demo",
            "Inventory files in the workspace",
            "default_action_params:\n  run_command:\n    command: ls -1\n",
        )
        .expect("skill");
    let config = workspace.config();
    let handoff = || {
        reply(json!({
            "selected_skill": "demo",
            "planned_actions": [{"type": "call_skill", "params": {}}]
        }))
    };
    let provider = ScriptedProvider::new(vec![
        handoff(),
        handoff(),
        reply(json!({"final_answer": "Two files."})),
    ]);
    let executor = ScriptedExecutor::new(vec![ScriptedExec::ok("a.txt\nb.txt\n")]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert_eq!(executor.commands(), ["ls -1"]);
    assert_eq!(result.final_summary.as_deref(), Some("Two files."));
}

/// Verifies a zero threshold replaces the very first pure self-handoff.
#[test]
fn zero_threshold_recovers_on_the_first_self_handoff() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.runtime.self_handoff_recovery_threshold = 0;
    let provider = ScriptedProvider::new(vec![reply(json!({
        "selected_skill": "demo",
        "planned_actions": [{"type": "call_skill", "params": {"skill_name": "demo"}}]
    }))]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let recovery = payloads(&result, EventType::SelfHandoffRecoveryApplied).expect("events");
    assert_eq!(recovery[0]["turn_index"], 1);
}

/// Verifies a failing command is retried once and then fails the run.
#[test]
fn failed_command_is_retried_once_then_fails_the_run() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![command_reply(&["ls missing"], "unreached")]);
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::failed(2, "no such file"),
        ScriptedExec::failed(2, "no such file"),
    ]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::StepExecutionFailed));
    assert_eq!(executor.commands(), ["ls missing", "ls missing"]);
    let steps = payloads(&result, EventType::SkillStepExecuted).expect("events");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["status"], "failed");
    assert_eq!(steps[0]["retry_count"], 1);
    assert!(
        result
            .run_dir
            .join("artifacts/turn_1_step-1_stderr.txt")
            .is_file()
    );
    let types = event_types(&result).expect("events");
    assert!(types.contains(&EventType::StepRetryScheduled));
    assert!(!types.contains(&EventType::RunFinished));
}

/// Verifies the abort policy fails the run without retrying the command.
#[test]
fn abort_policy_skips_the_command_retry() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.runtime.on_step_failure = StepFailurePolicy::Abort;
    let provider = ScriptedProvider::new(vec![command_reply(&["ls missing"], "unreached")]);
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::failed(2, "no such file"),
        ScriptedExec::ok("recovered"),
    ]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::StepExecutionFailed));
    assert_eq!(executor.commands().len(), 1);
}

/// Verifies a successful retry lets the rest of the turn run.
#[test]
fn command_retry_success_continues_the_turn() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![
        command_reply(&["ls"], "listed"),
        reply(json!({"answer": "a.txt only"})),
    ]);
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::failed(1, "flaky"),
        ScriptedExec::ok("a.txt\n"),
    ]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert_eq!(result.final_summary.as_deref(), Some("a.txt only"));
}

/// Verifies a run that never finishes fails once max_turns is reached.
#[test]
fn run_stops_after_max_turns() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let keep_going = || {
        reply(json!({
            "planned_actions": [{"type": "run_command", "params": {"command": "ls"}}]
        }))
    };
    let provider = ScriptedProvider::new(vec![keep_going(), keep_going(), keep_going()]);
    let executor = ScriptedExecutor::new(vec![
        ScriptedExec::ok("a.txt"),
        ScriptedExec::ok("a.txt"),
        ScriptedExec::ok("a.txt"),
    ]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest {
            max_turns: Some(2),
            ..RunRequest::new("inventory files")
        })
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::MaxTurnsExceeded));
    assert_eq!(provider.requests().len(), 2);
    let failed = payloads(&result, EventType::RunFailed).expect("events");
    assert_eq!(failed[0]["max_turns"], 2);
    // Step results of turn 1 are fed into the turn 2 prompt.
    assert!(provider.requests()[1].prompt.contains("step-1"));
}

/// Verifies an interrupt raised before the run fails it without any model call.
#[test]
fn pending_interrupt_fails_before_the_first_turn() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![finish_reply("unreached")]);
    let executor = ScriptedExecutor::default();
    let interrupt = InterruptFlag::new();
    interrupt.request("SIGINT");

    let result = Scheduler::new(&config, &provider, &executor)
        .with_interrupt(interrupt)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::Interrupted));
    assert!(provider.requests().is_empty());
    let signals = payloads(&result, EventType::SignalReceived).expect("events");
    assert_eq!(signals[0]["signal"], "SIGINT");
    let types = event_types(&result).expect("events");
    assert!(types.contains(&EventType::GracefulShutdownStarted));
}

/// Verifies a signal during a command lets the step finish and stops the next turn.
#[test]
fn interrupt_during_a_step_stops_at_the_next_turn() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![
        reply(json!({
            "selected_skill": "demo",
            "planned_actions": [{"type": "run_command", "params": {"command": "ls"}}]
        })),
        finish_reply("unreached"),
    ]);
    let interrupt = InterruptFlag::new();
    let executor =
        ScriptedExecutor::new(vec![ScriptedExec::ok("a.txt\n")]).interrupting(interrupt.clone());

    let result = Scheduler::new(&config, &provider, &executor)
        .with_interrupt(interrupt)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::Interrupted));
    assert_eq!(provider.requests().len(), 1);
    assert_eq!(provider.remaining(), 1);
    assert_eq!(executor.commands().len(), 1);
    let steps = payloads(&result, EventType::SkillStepExecuted).expect("events");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["status"], "success");
    assert!(
        result
            .run_dir
            .join("artifacts/turn_1_step-1_stdout.txt")
            .is_file()
    );
    let signals = payloads(&result, EventType::SignalReceived).expect("events");
    assert_eq!(signals[0]["signal"], "SIGINT");
}

/// Verifies missing provider credentials fail the run up front.
#[test]
fn missing_credentials_fail_before_any_model_call() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::unconfigured();
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::MissingProviderApiKey));
    assert!(provider.requests().is_empty());
}

/// Verifies an empty skills directory fails the run.
#[test]
fn empty_skills_dir_fails_the_run() {
    let workspace = TestWorkspace::new().expect("workspace");
    let config = workspace.config();
    let provider = ScriptedProvider::new(Vec::new());
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::NoSkillsFound));
    assert_eq!(result.message, "No skills found");
}

/// Verifies a broken skill file is reported and the rest of the catalog still loads.
#[test]
fn unparseable_skill_is_reported_and_skipped() {
    let workspace = demo_workspace();
    workspace
        .write_skill_file("broken", "no frontmatter here\n")
        .expect("broken skill");
    let config = workspace.config();
    let provider = ScriptedProvider::new(Vec::new());
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest {
            dry_run: true,
            ..RunRequest::new("inventory files")
        })
        .expect("run");

    assert!(result.is_success());
    let failures = payloads(&result, EventType::SkillParseFailed).expect("events");
    assert_eq!(failures.len(), 1);
    let loaded = payloads(&result, EventType::SkillCatalogLoaded).expect("events");
    assert_eq!(loaded[0]["skills_count"], 1);
}

/// Verifies the fail-fast strategy fails a task no skill matches.
#[test]
fn fail_fast_prefilter_rejects_unmatched_tasks() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.skills.prefilter_min_score = 101.0;
    config.skills.prefilter_zero_candidate_strategy = ZeroCandidateStrategy::FailFast;
    let provider = ScriptedProvider::new(Vec::new());
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert_eq!(result.failure, Some(FailureReason::PrefilterZeroCandidates));
}

/// Verifies the fallback strategy keeps every skill when none match.
#[test]
fn fallback_prefilter_keeps_every_skill() {
    let workspace = demo_workspace();
    workspace
        .write_skill("notes", "Summarize meeting notes", "")
        .expect("skill");
    let mut config = workspace.config();
    config.skills.prefilter_min_score = 101.0;
    let provider = ScriptedProvider::new(Vec::new());
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest {
            dry_run: true,
            ..RunRequest::new("inventory files")
        })
        .expect("run");

    let prefilter = payloads(&result, EventType::SkillPrefilterCompleted).expect("events");
    assert_eq!(prefilter[0]["candidate_count"], 2);
    assert_eq!(prefilter[0]["candidates"][0]["score"], 0.0);
}

/// Verifies native mode falls back to the JSON prompt when the tool request fails.
#[test]
fn native_request_failure_falls_back_to_json_prompt() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.model.structured_output_mode = StructuredOutputMode::NativeWithJsonFallback;
    config.runtime.max_llm_retries = 0;
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::Status {
            status: 400,
            body: "tools unsupported".to_string(),
        }),
        finish_reply("done"),
    ]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tool_names, ["agent_decision"]);
    assert!(!requests[0].force_tool_use);
    assert!(requests[1].tool_names.is_empty());
    assert_eq!(requests[1].attempt, 2);
    let fallback = payloads(&result, EventType::NativeToolFallback).expect("events");
    assert_eq!(fallback.len(), 1);
}

/// Verifies native-only mode forces the decision tool on the request.
#[test]
fn native_only_forces_the_decision_tool() {
    let workspace = demo_workspace();
    let mut config = workspace.config();
    config.model.structured_output_mode = StructuredOutputMode::NativeOnly;
    let provider = ScriptedProvider::new(vec![finish_reply("done")]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert!(provider.requests()[0].force_tool_use);
}

/// Verifies tool output is turned into a direct answer by the synthesis call.
#[test]
fn final_answer_is_synthesized_from_command_output() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![
        command_reply(&["ls -1"], "preliminary"),
        reply(json!({"final_answer": "Two files: a.txt and b.txt"})),
    ]);
    let executor = ScriptedExecutor::new(vec![ScriptedExec::ok("a.txt\nb.txt\n")]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert_eq!(
        result.final_summary.as_deref(),
        Some("Two files: a.txt and b.txt")
    );
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].prompt.contains("a.txt"));
    assert!(requests[1].tool_names.is_empty());
    assert!(
        result
            .run_dir
            .join("artifacts/final_answer_prompt_turn_1.txt")
            .is_file()
    );
    assert!(
        result
            .run_dir
            .join("artifacts/llm/final_answer_synthesis_turn_1_attempt_1_response.txt")
            .is_file()
    );
    let types = event_types(&result).expect("events");
    assert!(types.contains(&EventType::FinalAnswerSynthesisCompleted));
}

/// Verifies a failed synthesis call keeps the finish message as the summary.
#[test]
fn synthesis_failure_keeps_the_preliminary_summary() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![
        command_reply(&["ls -1"], "preliminary"),
        Err(ProviderError::Other("synthesis unavailable".to_string())),
    ]);
    let executor = ScriptedExecutor::new(vec![ScriptedExec::ok("a.txt\n")]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    assert_eq!(result.final_summary.as_deref(), Some("preliminary"));
    let failed = payloads(&result, EventType::FinalAnswerSynthesisFailed).expect("events");
    assert_eq!(failed.len(), 1);
}

/// Verifies requested paths outside the skill directory only yield a warning.
#[test]
fn disclosure_blocks_paths_outside_the_skill() {
    let workspace = demo_workspace();
    workspace
        .write_file("skills/demo/references/guide.md", "GUIDE-CONTENT\n")
        .expect("guide");
    workspace
        .write_file("skills/secrets.txt", "TOPSECRET\n")
        .expect("secret");
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![
        reply(json!({
            "selected_skill": "demo",
            "required_disclosure_paths": ["../secrets.txt", "references/guide.md"],
            "planned_actions": [{"type": "run_command", "params": {"command": "ls"}}]
        })),
        finish_reply("done"),
        reply(json!({"final_answer": "done"})),
    ]);
    let executor = ScriptedExecutor::new(vec![ScriptedExec::ok("a.txt\n")]);

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let disclosures = payloads(&result, EventType::SkillDisclosureLoaded).expect("events");
    let stage2 = disclosures
        .iter()
        .find(|payload| payload["stage"] == 2)
        .expect("stage 2 disclosure");
    assert_eq!(
        stage2["paths"],
        json!(["references/guide.md", "warning:../secrets.txt"])
    );
    let second_prompt = &provider.requests()[1].prompt;
    assert!(second_prompt.contains("GUIDE-CONTENT"));
    assert!(!second_prompt.contains("TOPSECRET"));
}

/// Verifies a handoff discloses the target skill's sections in the next prompt.
#[test]
fn call_skill_discloses_the_target_skill_next_turn() {
    let workspace = demo_workspace();
    workspace
        .write_skill("notes", "Summarize meeting notes", "")
        .expect("skill");
    let mut config = workspace.config();
    config.skills.prefilter_top_k = 1;
    config.skills.prefilter_min_score = 101.0;
    let provider = ScriptedProvider::new(vec![
        reply(json!({
            "selected_skill": "demo",
            "planned_actions": [{"type": "call_skill", "params": {"skill_name": "notes"}}]
        })),
        finish_reply("done"),
    ]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let disclosures = payloads(&result, EventType::SkillDisclosureLoaded).expect("events");
    let skills: Vec<&str> = disclosures
        .iter()
        .filter_map(|payload| payload["skill"].as_str())
        .collect();
    assert_eq!(skills, ["demo", "notes"]);
    assert!(provider.requests()[1].prompt.contains("notes:section:Purpose"));
}

/// Verifies same-named references of two skills are both disclosed under distinct keys.
#[test]
fn references_of_a_handed_off_skill_do_not_collide() {
    let workspace = demo_workspace();
    workspace
        .write_skill("notes", "Summarize meeting notes", "")
        .expect("skill");
    workspace
        .write_file("skills/demo/references/guide.md", "DEMO-GUIDE\n")
        .expect("demo guide");
    workspace
        .write_file("skills/notes/references/guide.md", "NOTES-GUIDE\n")
        .expect("notes guide");
    let mut config = workspace.config();
    config.skills.prefilter_top_k = 1;
    config.skills.prefilter_min_score = 101.0;
    let provider = ScriptedProvider::new(vec![
        reply(json!({
            "selected_skill": "demo",
            "required_disclosure_paths": ["references/guide.md"],
            "planned_actions": [{"type": "call_skill", "params": {"skill_name": "notes"}}]
        })),
        reply(json!({
            "selected_skill": "notes",
            "required_disclosure_paths": ["references/guide.md"],
            "planned_actions": [{"type": "ask_user", "params": {"question": "Which meeting?"}}]
        })),
        finish_reply("done"),
    ]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let third_prompt = &provider.requests()[2].prompt;
    assert!(third_prompt.contains("DEMO-GUIDE"));
    assert!(third_prompt.contains("NOTES-GUIDE"));
    let disclosures = payloads(&result, EventType::SkillDisclosureLoaded).expect("events");
    let stage2_paths: Vec<&Value> = disclosures
        .iter()
        .filter(|payload| payload["stage"] == 2)
        .map(|payload| &payload["paths"])
        .collect();
    assert_eq!(
        stage2_paths,
        [&json!(["references/guide.md"]), &json!(["notes:references/guide.md"])]
    );
}

/// Verifies ask_user is recorded as skipped and the turn continues.
#[test]
fn ask_user_is_skipped_without_failing() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![reply(json!({
        "planned_actions": [
            {"type": "ask_user", "params": {"question": "Which folder?"}},
            {"type": "finish", "params": {"message": "assumed current folder"}}
        ]
    }))]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new("inventory files"))
        .expect("run");

    assert!(result.is_success());
    let steps = payloads(&result, EventType::SkillStepExecuted).expect("events");
    assert_eq!(steps[0]["status"], "skipped");
    assert_eq!(result.final_summary.as_deref(), Some("assumed current folder"));
}

/// Verifies secrets in the task are redacted from artifacts and events.
#[test]
fn request_artifacts_are_scrubbed_of_secrets() {
    let workspace = demo_workspace();
    let config = workspace.config();
    let provider = ScriptedProvider::new(vec![finish_reply("done")]);
    let executor = ScriptedExecutor::default();

    let result = Scheduler::new(&config, &provider, &executor)
        .run(&RunRequest::new(
            "inventory files with api_key=supersecretvalue123",
        ))
        .expect("run");

    assert!(result.is_success());
    let request = fs::read_to_string(
        result
            .run_dir
            .join("artifacts/llm/decision_turn_1_attempt_1_request.txt"),
    )
    .expect("request artifact");
    assert!(!request.contains("supersecretvalue123"));
    assert!(request.contains("***REDACTED***"));
    let events = fs::read_to_string(&result.events_path).expect("events");
    assert!(!events.contains("supersecretvalue123"));
}
