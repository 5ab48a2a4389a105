//! Decision and final-answer prompt builder.
//!
//! Prompts are rendered from embedded templates whose sections are marked with
//! `<!-- section:KEY required|droppable -->`. When the rendered decision prompt
//! exceeds the turn's prompt budget, droppable sections are removed in a fixed
//! order.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::budget::{compute_token_budget, estimate_tokens};
use crate::core::types::{SkillCandidate, StepExecutionResult, TokenBudget};
use crate::mcp::ToolInfo;
use crate::skills::registry::CatalogEntry;

const DECISION_TEMPLATE: &str = include_str!("prompts/decision.md");
const FINAL_ANSWER_TEMPLATE: &str = include_str!("prompts/final_answer.md");

/// Bytes allowed per allocated prompt token.
pub const BYTES_PER_TOKEN: usize = 4;

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 3] = ["session", "mcp_tools", "catalog"];

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("decision", DECISION_TEMPLATE)
            .expect("decision template should be valid");
        env.add_template("final_answer", FINAL_ANSWER_TEMPLATE)
            .expect("final answer template should be valid");
        Self { env }
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker pattern should be valid")
    });

    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Remove droppable sections until the prompt fits `budget_bytes`. Returns dropped keys.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget_bytes: usize) -> Vec<String> {
    let total_len = |secs: &[ParsedSection]| -> usize {
        let separators = secs.len().saturating_sub(1) * 2;
        secs.iter().map(|s| s.content.len()).sum::<usize>() + separators
    };

    let mut dropped = Vec::new();
    for key in DROP_ORDER {
        if total_len(sections) <= budget_bytes {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
            dropped.push(key.to_string());
        }
    }
    dropped
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Everything the decision prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub candidates: &'a [SkillCandidate],
    pub catalog: &'a [CatalogEntry],
    pub disclosed: &'a BTreeMap<String, String>,
    pub step_results: &'a [StepExecutionResult],
    pub session_context: Option<&'a str>,
    /// Skill whose self-handoff was just blocked.
    pub blocked_skill: Option<&'a str>,
    pub mcp_tools: &'a [ToolInfo],
    pub use_native_tools: bool,
}

/// A composed prompt and the budget it was sized against.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBuild {
    pub prompt: String,
    pub budget: TokenBudget,
    pub estimated_input_tokens: usize,
    pub dropped_sections: Vec<String>,
    /// Disclosure keys left out to stay within the disclosure allocation.
    pub omitted_disclosures: Vec<String>,
}

#[derive(Serialize)]
struct RunState<'a> {
    executed_steps: &'a [StepExecutionResult],
    executed_step_count: usize,
}

/// Build the per-turn decision prompt.
pub fn build_decision_prompt(
    inputs: &PromptInputs<'_>,
    max_context_tokens: usize,
    response_headroom_tokens: usize,
) -> Result<PromptBuild> {
    let disclosed = serde_json::to_string(inputs.disclosed)?;
    let budget = compute_token_budget(max_context_tokens, response_headroom_tokens, &disclosed);
    let (disclosed, omitted_disclosures) =
        fit_disclosed(inputs.disclosed, &disclosed, budget.allocated_disclosure_tokens)?;
    let run_state = serde_json::to_string(&RunState {
        executed_steps: inputs.step_results,
        executed_step_count: inputs.step_results.len(),
    })?;
    let mcp_tools = if inputs.mcp_tools.is_empty() {
        None
    } else {
        Some(serde_json::to_string(inputs.mcp_tools)?)
    };

    let template = ENGINE.env.get_template("decision")?;
    let rendered = template.render(context! {
        use_native_tools => inputs.use_native_tools,
        task => inputs.task.trim(),
        blocked_skill => inputs.blocked_skill,
        session_context => inputs.session_context.map(str::trim).filter(|s| !s.is_empty()),
        run_state => run_state,
        catalog => serde_json::to_string(inputs.catalog)?,
        candidates => serde_json::to_string(inputs.candidates)?,
        disclosed => disclosed,
        mcp_tools => mcp_tools,
    })?;

    let mut sections = parse_sections(&rendered);
    let budget_bytes = budget.allocated_prompt_tokens.saturating_mul(BYTES_PER_TOKEN);
    let dropped_sections = apply_budget_to_sections(&mut sections, budget_bytes);
    let prompt = render_sections(&sections);
    Ok(PromptBuild {
        estimated_input_tokens: estimate_tokens(&prompt),
        prompt,
        budget,
        dropped_sections,
        omitted_disclosures,
    })
}

/// Serialized disclosure that fits `allowance_tokens`.
///
/// Snippets are kept whole, in key order; any that would push the estimate
/// past the allowance are left out and their keys returned.
fn fit_disclosed(
    disclosed: &BTreeMap<String, String>,
    serialized: &str,
    allowance_tokens: usize,
) -> Result<(String, Vec<String>)> {
    if estimate_tokens(serialized) <= allowance_tokens {
        return Ok((serialized.to_string(), Vec::new()));
    }
    let mut kept: BTreeMap<&str, &str> = BTreeMap::new();
    let mut omitted = Vec::new();
    for (key, value) in disclosed {
        kept.insert(key, value);
        if estimate_tokens(&serde_json::to_string(&kept)?) > allowance_tokens {
            kept.remove(key.as_str());
            omitted.push(key.clone());
        }
    }
    debug!(omitted = omitted.len(), allowance_tokens, "disclosure trimmed to allocation");
    Ok((serde_json::to_string(&kept)?, omitted))
}

/// One successful step's output offered to final-answer synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub step_id: String,
    pub stdout: String,
}

/// Build the tool-free prompt asking for a direct final answer.
pub fn build_final_answer_prompt(
    task: &str,
    preliminary_summary: Option<&str>,
    evidence: &[Evidence],
) -> Result<String> {
    let template = ENGINE.env.get_template("final_answer")?;
    let rendered = template.render(context! {
        task => task.trim(),
        preliminary => preliminary_summary.map(str::trim).filter(|s| !s.is_empty()),
        evidence => serde_json::to_string(evidence)?,
    })?;
    Ok(render_sections(&parse_sections(&rendered)))
}

/// Hex sha256 of a composed prompt.
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepStatus;

    fn catalog() -> Vec<CatalogEntry> {
        vec![CatalogEntry {
            name: "inventory".to_string(),
            description: "List files ".repeat(40),
            version: "0.1.0".to_string(),
            tags: vec!["files".to_string()],
            allowed_tools: Vec::new(),
            references_index: vec!["references/guide.md".to_string()],
            scripts_index: Vec::new(),
        }]
    }

    fn candidates() -> Vec<SkillCandidate> {
        vec![SkillCandidate {
            skill_name: "inventory".to_string(),
            score: 90.0,
            reason: "Matched name/description/tags".to_string(),
        }]
    }

    fn inputs<'a>(
        catalog: &'a [CatalogEntry],
        candidates: &'a [SkillCandidate],
        disclosed: &'a BTreeMap<String, String>,
        steps: &'a [StepExecutionResult],
    ) -> PromptInputs<'a> {
        PromptInputs {
            task: "inventory files",
            candidates,
            catalog,
            disclosed,
            step_results: steps,
            session_context: Some("[{\"task\":\"earlier\"}]"),
            blocked_skill: None,
            mcp_tools: &[],
            use_native_tools: false,
        }
    }

    /// Verifies sections appear in a fixed order with the JSON instruction.
    #[test]
    fn decision_prompt_sections_are_ordered() {
        let catalog = catalog();
        let candidates = candidates();
        let disclosed = BTreeMap::from([("section:Purpose".to_string(), "Count files.".to_string())]);
        let steps = vec![StepExecutionResult {
            step_id: "step-1".to_string(),
            turn_index: 1,
            exit_code: 0,
            stdout_summary: "a.md".to_string(),
            stderr_summary: String::new(),
            retry_count: 0,
            status: StepStatus::Success,
            stdout_artifact: None,
            stderr_artifact: None,
        }];
        let build = build_decision_prompt(&inputs(&catalog, &candidates, &disclosed, &steps), 32_000, 2_000)
            .expect("build");
        let prompt = &build.prompt;

        assert!(prompt.contains("Skill calls are OPTIONAL."));
        assert!(prompt.contains("Return ONLY a JSON object"));
        let order = [
            "TASK:\ninventory files",
            "SESSION_CONTEXT:",
            "RUN_STATE:",
            "ALL_SKILL_FRONTMATTER:",
            "CANDIDATE_SKILLS:",
            "DISCLOSED_CONTEXT:",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|needle| prompt.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(prompt.contains("\"executed_step_count\":1"));
        assert!(!prompt.contains("MCP_TOOLS:"));
        assert!(!prompt.contains("<!--"));
        assert!(build.dropped_sections.is_empty());
        assert_eq!(build.estimated_input_tokens, estimate_tokens(prompt));
    }

    #[test]
    fn native_mode_and_blocked_skill_change_instruction() {
        let catalog = catalog();
        let candidates = candidates();
        let disclosed = BTreeMap::new();
        let mut input = inputs(&catalog, &candidates, &disclosed, &[]);
        input.use_native_tools = true;
        input.blocked_skill = Some("inventory");
        let prompt = build_decision_prompt(&input, 32_000, 2_000)
            .expect("build")
            .prompt;
        assert!(prompt.contains("agent_decision tool"));
        assert!(!prompt.contains("Return ONLY a JSON object"));
        assert!(prompt.contains("CONSTRAINT:\nHanding off to skill \"inventory\" again is blocked."));
    }

    /// Verifies a tight budget drops session context before the catalog.
    #[test]
    fn tight_budget_drops_droppable_sections_in_order() {
        let catalog = catalog();
        let candidates = candidates();
        let disclosed = BTreeMap::new();
        let input = inputs(&catalog, &candidates, &disclosed, &[]);

        let full = build_decision_prompt(&input, 100_000, 0).expect("build");
        let catalog_len = full
            .prompt
            .find("CANDIDATE_SKILLS:")
            .expect("candidates")
            - full.prompt.find("ALL_SKILL_FRONTMATTER:").expect("catalog");

        // Enough room once the session and catalog sections are gone.
        let target_bytes = full.prompt.len() - catalog_len;
        let tokens = target_bytes / BYTES_PER_TOKEN;
        let build = build_decision_prompt(&input, tokens, 0).expect("build");
        assert_eq!(build.dropped_sections, vec!["session", "catalog"]);
        assert!(!build.prompt.contains("SESSION_CONTEXT:"));
        assert!(!build.prompt.contains("ALL_SKILL_FRONTMATTER:"));
        assert!(build.prompt.contains("TASK:"));
        assert!(build.prompt.contains("DISCLOSED_CONTEXT:"));
    }

    /// Verifies disclosed snippets never take more than half the available budget.
    #[test]
    fn disclosure_is_trimmed_to_its_allocation() {
        let catalog = catalog();
        let candidates = candidates();
        let disclosed = BTreeMap::from([
            ("references/big.md".to_string(), "B".repeat(4_000)),
            ("section:Purpose".to_string(), "Count files.".to_string()),
        ]);
        let input = inputs(&catalog, &candidates, &disclosed, &[]);

        let roomy = build_decision_prompt(&input, 32_000, 2_000).expect("build");
        assert!(roomy.omitted_disclosures.is_empty());
        assert!(roomy.prompt.contains(&"B".repeat(4_000)));

        let tight = build_decision_prompt(&input, 1_000, 0).expect("build");
        assert_eq!(tight.budget.allocated_disclosure_tokens, 500);
        assert_eq!(tight.omitted_disclosures, vec!["references/big.md"]);
        assert!(!tight.prompt.contains("BBBB"));
        assert!(tight.prompt.contains("Count files."));
    }

    #[test]
    fn final_answer_prompt_embeds_evidence() {
        let evidence = vec![Evidence {
            step_id: "step-1".to_string(),
            stdout: "README.md".to_string(),
        }];
        let prompt = build_final_answer_prompt("list docs", None, &evidence).expect("build");
        assert!(prompt.starts_with("You are generating the final answer"));
        assert!(prompt.contains("PRELIMINARY_SUMMARY:\n(none)"));
        assert!(prompt.contains("TOOL_EVIDENCE:\n[{\"step_id\":\"step-1\",\"stdout\":\"README.md\"}]"));
    }

    #[test]
    fn prompt_hash_is_sha256_hex() {
        assert_eq!(
            prompt_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
