//! Skill candidate prefilter: fuzzy ranking of the catalog against the task.

use serde::{Deserialize, Serialize};

use crate::core::fuzzy::partial_ratio;
use crate::core::types::SkillCandidate;

pub const MATCH_REASON: &str = "Matched name/description/tags";
pub const FALLBACK_REASON: &str = "Fallback zero-candidate strategy";

/// What to do when no skill clears the prefilter threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZeroCandidateStrategy {
    #[default]
    FallbackAllSkills,
    FailFast,
}

/// The fields of a skill the prefilter scores against.
#[derive(Debug, Clone, Copy)]
pub struct PrefilterEntry<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub tags: &'a [String],
}

impl PrefilterEntry<'_> {
    fn haystack(&self) -> String {
        let mut parts = vec![self.name, self.description];
        parts.extend(self.tags.iter().map(String::as_str));
        parts.join(" ").to_lowercase()
    }
}

/// Score every entry, keep those at or above `min_score`, best first, at most `top_k`.
///
/// Ties keep catalog order.
pub fn prefilter(
    task: &str,
    entries: &[PrefilterEntry<'_>],
    top_k: usize,
    min_score: f64,
) -> Vec<SkillCandidate> {
    let task = task.to_lowercase();
    let mut scored: Vec<SkillCandidate> = entries
        .iter()
        .filter_map(|entry| {
            let score = round2(partial_ratio(&task, &entry.haystack()));
            (score >= min_score).then(|| SkillCandidate {
                skill_name: entry.name.to_string(),
                score,
                reason: MATCH_REASON.to_string(),
            })
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    scored
}

/// Apply the zero-candidate strategy. `None` means the run must fail.
pub fn resolve_candidates(
    candidates: Vec<SkillCandidate>,
    entries: &[PrefilterEntry<'_>],
    top_k: usize,
    strategy: ZeroCandidateStrategy,
) -> Option<Vec<SkillCandidate>> {
    if !candidates.is_empty() {
        return Some(candidates);
    }
    match strategy {
        ZeroCandidateStrategy::FailFast => None,
        ZeroCandidateStrategy::FallbackAllSkills => Some(
            entries
                .iter()
                .take(top_k)
                .map(|entry| SkillCandidate {
                    skill_name: entry.name.to_string(),
                    score: 0.0,
                    reason: FALLBACK_REASON.to_string(),
                })
                .collect(),
        ),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
