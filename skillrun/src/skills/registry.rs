//! Skill catalog loading and the derived tables the scheduler needs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::decoder::DecoderTables;
use crate::core::prefilter::PrefilterEntry;
use crate::skills::parser::{SKILL_FILE, Skill, parse_skill};

/// A skill directory that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillParseFailure {
    pub skill_dir: PathBuf,
    pub error: String,
}

/// Prompt-facing summary of one skill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub version: String,
    pub tags: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub references_index: Vec<String>,
    pub scripts_index: Vec<String>,
}

impl CatalogEntry {
    fn from_skill(skill: &Skill) -> Self {
        Self {
            name: skill.metadata.name.clone(),
            description: skill.metadata.description.clone(),
            version: skill.metadata.version.clone(),
            tags: skill.metadata.tags.clone(),
            allowed_tools: skill.metadata.allowed_tools.clone(),
            references_index: skill.metadata.references_index.clone(),
            scripts_index: skill.scripts.clone(),
        }
    }
}

/// Skills loaded once and reusable across runs of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSkills {
    pub skills_dir: PathBuf,
    pub skills: Vec<Skill>,
    pub tables: DecoderTables,
    pub catalog: Vec<CatalogEntry>,
    pub parse_failures: Vec<SkillParseFailure>,
}

impl PreparedSkills {
    pub fn by_name(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|skill| skill.name() == name)
    }

    pub fn prefilter_entries(&self) -> Vec<PrefilterEntry<'_>> {
        self.skills
            .iter()
            .map(|skill| PrefilterEntry {
                name: &skill.metadata.name,
                description: &skill.metadata.description,
                tags: &skill.metadata.tags,
            })
            .collect()
    }
}

/// Absolute form of `dir`, canonical when it exists.
pub fn resolve_skills_dir(dir: &Path) -> Result<PathBuf> {
    if dir.exists() {
        return fs::canonicalize(dir).with_context(|| format!("resolve {}", dir.display()));
    }
    std::path::absolute(dir).with_context(|| format!("resolve {}", dir.display()))
}

/// Load every skill under `skills_dir` and build the decoder tables and catalog.
///
/// Child directories are visited in sorted order. Directories without a
/// `SKILL.md` are ignored; ones whose `SKILL.md` fails to parse are recorded in
/// `parse_failures` and skipped.
#[instrument(skip_all, fields(skills_dir = %skills_dir.display()))]
pub fn prepare_skills(skills_dir: &Path) -> Result<PreparedSkills> {
    let skills_dir = resolve_skills_dir(skills_dir)?;
    let mut skills = Vec::new();
    let mut parse_failures = Vec::new();

    if skills_dir.is_dir() {
        let mut children: Vec<PathBuf> = fs::read_dir(&skills_dir)
            .with_context(|| format!("read skills dir {}", skills_dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir() && path.join(SKILL_FILE).is_file())
            .collect();
        children.sort();
        for child in children {
            match parse_skill(&child) {
                Ok(skill) => skills.push(skill),
                Err(err) => {
                    warn!(skill_dir = %child.display(), err = %format!("{err:#}"), "skipping unparseable skill");
                    parse_failures.push(SkillParseFailure {
                        skill_dir: child,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
    }
    debug!(count = skills.len(), "loaded skills");

    Ok(PreparedSkills {
        tables: build_decoder_tables(&skills),
        catalog: skills.iter().map(CatalogEntry::from_skill).collect(),
        skills_dir,
        skills,
        parse_failures,
    })
}

fn build_decoder_tables(skills: &[Skill]) -> DecoderTables {
    let mut tables = DecoderTables::default();
    for skill in skills {
        if !skill.metadata.action_aliases.is_empty() {
            tables
                .action_aliases
                .insert(skill.name().to_string(), skill.metadata.action_aliases.clone());
        }
        if !skill.metadata.default_action_params.is_empty() {
            tables.default_action_params.insert(
                skill.name().to_string(),
                skill.metadata.default_action_params.clone(),
            );
        }
    }
    tables
}
