//! Progressive disclosure of skill content under byte and token caps.
//!
//! - Stage 1: the first two body sections of a skill.
//! - Stage 2: model-requested files, resolved inside the skill directory.
//! - Stage 3: declared script paths (names only).
//!
//! Requested paths that escape the skill directory never yield content; they
//! are disclosed as a `warning:<path>` placeholder instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::budget::estimate_tokens;
use crate::skills::parser::Skill;

pub const STAGE1_SECTION_COUNT: usize = 2;
pub const PROVENANCE_WARNING: &str = "Blocked by provenance validation";
pub const SCRIPT_DECLARED: &str = "declared";

/// One stage's disclosed snippets, keyed by logical path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisclosedContext {
    pub stage: u8,
    pub snippets: BTreeMap<String, String>,
    pub total_bytes: usize,
    pub total_tokens: usize,
}

impl DisclosedContext {
    pub fn paths(&self) -> Vec<String> {
        self.snippets.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisclosureEngine {
    pub max_bytes: usize,
    pub max_tokens: usize,
}

impl DisclosureEngine {
    pub fn new(max_bytes: usize, max_tokens: usize) -> Self {
        Self {
            max_bytes,
            max_tokens,
        }
    }

    /// First sections of `skill`. `namespace` prefixes keys for secondary skills.
    pub fn stage1(&self, skill: &Skill, namespace: Option<&str>) -> DisclosedContext {
        let snippets: BTreeMap<String, String> = skill
            .sections
            .iter()
            .take(STAGE1_SECTION_COUNT)
            .map(|section| {
                (
                    scoped_key(namespace, format!("section:{}", section.title)),
                    section.content.clone(),
                )
            })
            .collect();
        let content = skill
            .sections
            .iter()
            .take(STAGE1_SECTION_COUNT)
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        DisclosedContext {
            stage: 1,
            snippets,
            total_bytes: content.len(),
            total_tokens: estimate_tokens(&content),
        }
    }

    /// Requested reference files, in request order.
    ///
    /// The first file that would push either cap over its limit ends content
    /// disclosure for this call: it and every later file are skipped whole.
    /// Escaping paths still get their warning placeholder.
    pub fn stage2(
        &self,
        skill: &Skill,
        requested_paths: &[String],
        namespace: Option<&str>,
    ) -> DisclosedContext {
        let mut snippets = BTreeMap::new();
        let mut used_bytes = 0usize;
        let mut used_tokens = 0usize;
        let mut capped = false;

        for rel in requested_paths {
            let Some(path) = resolve_reference(&skill.skill_dir, rel) else {
                snippets.insert(
                    scoped_key(namespace, format!("warning:{rel}")),
                    PROVENANCE_WARNING.to_string(),
                );
                continue;
            };
            if capped {
                debug!(path = %rel, "disclosure budget exhausted, skipping");
                continue;
            }
            let Some(path) = path else {
                debug!(path = %rel, "requested disclosure path not found");
                continue;
            };
            let text = match fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "failed to read disclosure file");
                    continue;
                }
            };
            let bytes = text.len();
            let tokens = estimate_tokens(&text);
            if used_bytes + bytes > self.max_bytes || used_tokens + tokens > self.max_tokens {
                debug!(path = %rel, bytes, tokens, "disclosure file exceeds remaining budget");
                capped = true;
                continue;
            }
            used_bytes += bytes;
            used_tokens += tokens;
            snippets.insert(scoped_key(namespace, rel.clone()), text);
        }

        DisclosedContext {
            stage: 2,
            snippets,
            total_bytes: used_bytes,
            total_tokens: used_tokens,
        }
    }

    /// Declared scripts, by name only.
    pub fn stage3(&self, skill: &Skill, namespace: Option<&str>) -> DisclosedContext {
        let snippets: BTreeMap<String, String> = skill
            .scripts
            .iter()
            .map(|rel| {
                (
                    scoped_key(namespace, format!("script:{rel}")),
                    SCRIPT_DECLARED.to_string(),
                )
            })
            .collect();
        let content = snippets.keys().cloned().collect::<Vec<_>>().join("\n");
        DisclosedContext {
            stage: 3,
            snippets,
            total_bytes: content.len(),
            total_tokens: estimate_tokens(&content),
        }
    }
}

/// Keys of a handed-off skill carry its name so they never collide with the
/// primary skill's keys in the accumulator.
fn scoped_key(namespace: Option<&str>, key: String) -> String {
    match namespace {
        Some(prefix) => format!("{prefix}:{key}"),
        None => key,
    }
}

/// Resolve `rel` for disclosure.
///
/// `None` when the path escapes `skill_dir`; `Some(None)` when it is inside but
/// no file exists at `skill_dir/rel` or `skill_dir/references/rel`.
fn resolve_reference(skill_dir: &Path, rel: &str) -> Option<Option<PathBuf>> {
    if !is_within_directory(skill_dir, &skill_dir.join(rel)) {
        return None;
    }
    let candidates = [skill_dir.join(rel), skill_dir.join("references").join(rel)];
    let Some(found) = candidates.into_iter().find(|path| path.is_file()) else {
        return Some(None);
    };
    // Symlinks inside the skill directory may still point outside it.
    if !is_within_directory(skill_dir, &found) {
        return None;
    }
    Some(Some(found))
}

pub fn is_within_directory(base: &Path, target: &Path) -> bool {
    resolve_path(target).starts_with(resolve_path(base))
}

/// Canonical path when it exists, else a lexical normalization.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Run-scoped disclosure accumulator. Keys only ever get added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisclosureAccumulator {
    snippets: BTreeMap<String, String>,
}

impl DisclosureAccumulator {
    /// Merge a stage's snippets, keeping any existing value. Returns the new keys.
    pub fn merge(&mut self, context: &DisclosedContext) -> Vec<String> {
        let mut added = Vec::new();
        for (key, value) in &context.snippets {
            if !self.snippets.contains_key(key) {
                self.snippets.insert(key.clone(), value.clone());
                added.push(key.clone());
            }
        }
        added
    }

    pub fn snippets(&self) -> &BTreeMap<String, String> {
        &self.snippets
    }

    pub fn paths(&self) -> Vec<String> {
        self.snippets.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::parser::parse_skill;

    fn skill_with_refs(root: &Path) -> Skill {
        let dir = root.join("inventory");
        fs::create_dir_all(dir.join("references")).expect("mkdir");
        fs::create_dir_all(dir.join("scripts")).expect("mkdir");
        fs::write(
            dir.join("SKILL.md"),
            "---\nname: inventory\ndescription: list files\n---\n# Purpose\nFind.\n# Steps\nRun.\n# Notes\nMore.\n",
        )
        .expect("write skill");
        fs::write(dir.join("references/guide.md"), "g".repeat(40)).expect("write");
        fs::write(dir.join("references/big.md"), "b".repeat(400)).expect("write");
        fs::write(dir.join("references/small.md"), "s".repeat(8)).expect("write");
        fs::write(dir.join("scripts/run.sh"), "echo").expect("write");
        fs::write(root.join("secrets.txt"), "hunter2").expect("write secret");
        parse_skill(&dir).expect("parse")
    }

    #[test]
    fn stage1_discloses_first_two_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());
        let engine = DisclosureEngine::new(1000, 1000);

        let ctx = engine.stage1(&skill, None);
        assert_eq!(ctx.stage, 1);
        assert_eq!(ctx.paths(), vec!["section:Purpose", "section:Steps"]);
        assert_eq!(ctx.total_bytes, "Find.\n\nRun.".len());

        let namespaced = engine.stage1(&skill, Some("inventory"));
        assert!(namespaced.snippets.contains_key("inventory:section:Purpose"));
    }

    /// Verifies a traversal outside the skill directory yields only a warning.
    #[test]
    fn stage2_blocks_paths_outside_skill_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());
        let engine = DisclosureEngine::new(1000, 1000);

        let ctx = engine.stage2(&skill, &["../secrets.txt".to_string()], None);
        assert_eq!(
            ctx.snippets.get("warning:../secrets.txt").map(String::as_str),
            Some(PROVENANCE_WARNING)
        );
        assert!(ctx.snippets.values().all(|value| !value.contains("hunter2")));
        assert_eq!(ctx.total_bytes, 0);
    }

    #[test]
    fn stage2_resolves_references_and_skips_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());
        let engine = DisclosureEngine::new(1000, 1000);

        let ctx = engine.stage2(
            &skill,
            &[
                "references/guide.md".to_string(),
                "small.md".to_string(),
                "missing.md".to_string(),
            ],
            None,
        );
        assert_eq!(ctx.paths(), vec!["references/guide.md", "small.md"]);
        assert_eq!(ctx.total_bytes, 48);
        assert_eq!(ctx.total_tokens, 12);
    }

    /// Verifies the first file over a cap ends content disclosure for the call.
    #[test]
    fn stage2_stops_at_the_first_file_over_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());
        let engine = DisclosureEngine::new(100, 1000);

        let ctx = engine.stage2(
            &skill,
            &["references/big.md".to_string(), "references/small.md".to_string()],
            None,
        );
        assert!(ctx.paths().is_empty());
        assert_eq!(ctx.total_bytes, 0);

        let fits_first = engine.stage2(
            &skill,
            &[
                "references/guide.md".to_string(),
                "references/big.md".to_string(),
                "references/small.md".to_string(),
            ],
            None,
        );
        assert_eq!(fits_first.paths(), vec!["references/guide.md"]);

        let token_capped = DisclosureEngine::new(10_000, 11).stage2(
            &skill,
            &["references/guide.md".to_string(), "references/small.md".to_string()],
            None,
        );
        assert_eq!(token_capped.paths(), vec!["references/guide.md"]);
    }

    #[test]
    fn stage2_still_warns_about_escapes_after_the_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());

        let ctx = DisclosureEngine::new(100, 1000).stage2(
            &skill,
            &["references/big.md".to_string(), "../secrets.txt".to_string()],
            None,
        );
        assert_eq!(ctx.paths(), vec!["warning:../secrets.txt"]);
    }

    /// Verifies a handed-off skill's references are keyed under its name.
    #[test]
    fn namespaced_stages_prefix_every_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());
        let engine = DisclosureEngine::new(1000, 1000);

        let refs = engine.stage2(
            &skill,
            &["references/guide.md".to_string(), "../secrets.txt".to_string()],
            Some("inventory"),
        );
        assert_eq!(
            refs.paths(),
            vec!["inventory:references/guide.md", "inventory:warning:../secrets.txt"]
        );

        let scripts = engine.stage3(&skill, Some("inventory"));
        assert_eq!(scripts.paths(), vec!["inventory:script:scripts/run.sh"]);
    }

    #[test]
    fn stage3_lists_scripts_by_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let skill = skill_with_refs(temp.path());
        let ctx = DisclosureEngine::new(0, 0).stage3(&skill, None);
        assert_eq!(ctx.stage, 3);
        assert_eq!(
            ctx.snippets.get("script:scripts/run.sh").map(String::as_str),
            Some(SCRIPT_DECLARED)
        );
    }

    /// Verifies the accumulator only grows and never overwrites a key.
    #[test]
    fn accumulator_is_monotonic() {
        let mut acc = DisclosureAccumulator::default();
        let first = DisclosedContext {
            stage: 1,
            snippets: BTreeMap::from([("section:A".to_string(), "one".to_string())]),
            ..DisclosedContext::default()
        };
        let second = DisclosedContext {
            stage: 2,
            snippets: BTreeMap::from([
                ("section:A".to_string(), "changed".to_string()),
                ("references/b.md".to_string(), "two".to_string()),
            ]),
            ..DisclosedContext::default()
        };
        assert_eq!(acc.merge(&first), vec!["section:A"]);
        assert_eq!(acc.merge(&second), vec!["references/b.md"]);
        assert_eq!(acc.snippets().get("section:A").map(String::as_str), Some("one"));
        assert_eq!(acc.paths().len(), 2);
    }

    #[test]
    fn out_of_tree_detection_is_lexical_for_missing_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("skill");
        fs::create_dir_all(&base).expect("mkdir");
        let escapes: Vec<&str> = ["references/../ok.md", "../../etc/passwd", "/etc/passwd"]
            .into_iter()
            .filter(|rel| !is_within_directory(&base, &base.join(rel)))
            .collect();
        assert_eq!(escapes, ["../../etc/passwd", "/etc/passwd"]);
    }
}
