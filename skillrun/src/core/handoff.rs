//! Self-handoff loop breaker.
//!
//! A decision is a *pure self-handoff* when it selects a skill and every
//! planned action is `call_skill` targeting that same skill. Such a turn does
//! no work. The breaker replaces a pure self-handoff with a recovery decision
//! once `threshold` of them have executed back to back, and reports a loop when
//! one more slips through anyway.

use serde_json::{Map, Value};

use crate::core::command::normalize_command;
use crate::core::types::{ActionStep, ActionType, ModelDecision};

pub const RECOVERY_FINISH_MESSAGE: &str = "Recovered from repeated self-handoff loop.";
pub const MAX_RECOVERY_COMMANDS: usize = 2;

pub fn is_pure_self_handoff(decision: &ModelDecision) -> bool {
    let Some(selected) = decision.selected_skill() else {
        return false;
    };
    !decision.planned_actions.is_empty()
        && decision.planned_actions.iter().all(|action| {
            action.action_type == ActionType::CallSkill
                && action.param_str("skill_name").unwrap_or(selected) == selected
        })
}

/// Run-local breaker state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfHandoffState {
    pub consecutive_turns: u32,
    pub blocked_skill: Option<String>,
}

/// What [`SelfHandoffState::record`] observed for an executed decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// Decision did real work; the counter was reset.
    Cleared,
    /// Another pure self-handoff executed.
    Detected { skill: String, consecutive_turns: u32 },
    /// Too many consecutive pure self-handoffs executed.
    Loop { skill: String, consecutive_turns: u32 },
}

impl SelfHandoffState {
    /// Whether `decision` must be replaced by a recovery decision before execution.
    pub fn needs_recovery(&self, decision: &ModelDecision, threshold: u32) -> bool {
        is_pure_self_handoff(decision) && self.consecutive_turns >= threshold
    }

    /// Update the counter after `decision` has executed.
    pub fn record(&mut self, decision: &ModelDecision, threshold: u32) -> HandoffOutcome {
        let skill = match decision.selected_skill() {
            Some(skill) if is_pure_self_handoff(decision) => skill.to_string(),
            _ => {
                self.consecutive_turns = 0;
                self.blocked_skill = None;
                return HandoffOutcome::Cleared;
            }
        };
        self.consecutive_turns += 1;
        self.blocked_skill = Some(skill.clone());
        if self.consecutive_turns > threshold {
            HandoffOutcome::Loop {
                skill,
                consecutive_turns: self.consecutive_turns,
            }
        } else {
            HandoffOutcome::Detected {
                skill,
                consecutive_turns: self.consecutive_turns,
            }
        }
    }
}

/// Build the recovery decision for a blocked self-handoff.
///
/// Up to [`MAX_RECOVERY_COMMANDS`] of the skill's own default commands run,
/// then the run finishes. Without defaults the recovery is a bare `finish`.
pub fn build_recovery_decision(
    original: &ModelDecision,
    default_commands: &[String],
    rg_available: bool,
) -> ModelDecision {
    let mut actions: Vec<ActionStep> = default_commands
        .iter()
        .take(MAX_RECOVERY_COMMANDS)
        .map(|command| {
            let mut params = Map::new();
            params.insert(
                "command".to_string(),
                Value::String(normalize_command(command, rg_available)),
            );
            ActionStep::new(ActionType::RunCommand, params)
        })
        .collect();
    actions.push(ActionStep::finish(Some(RECOVERY_FINISH_MESSAGE)));
    ModelDecision {
        selected_skill: original.selected_skill.clone(),
        reasoning_summary: format!(
            "Self-handoff to {} blocked; running skill defaults instead.",
            original.selected_skill().unwrap_or("unknown")
        ),
        required_disclosure_paths: Vec::new(),
        planned_actions: actions,
    }
}
