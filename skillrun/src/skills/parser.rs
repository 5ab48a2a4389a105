//! `SKILL.md` parsing: YAML frontmatter, markdown sections, file indexes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Map, Value};
use serde_yaml::{Mapping, Value as YamlValue};

pub const SKILL_FILE: &str = "SKILL.md";
const DEFAULT_VERSION: &str = "0.1.0";
const FRONTMATTER_START: &str = "---\n";
const FRONTMATTER_END: &str = "\n---\n";

/// Frontmatter fields of a skill.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub version: String,
    pub allowed_tools: Vec<String>,
    pub references_index: Vec<String>,
    pub action_aliases: BTreeMap<String, String>,
    /// Action name -> default params, in declaration order.
    pub default_action_params: Vec<(String, Map<String, Value>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillSection {
    pub title: String,
    pub content: String,
}

/// A loaded skill. Immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Skill {
    pub metadata: SkillMetadata,
    pub skill_dir: PathBuf,
    pub skill_md_path: PathBuf,
    pub body: String,
    pub sections: Vec<SkillSection>,
    pub references: Vec<String>,
    pub scripts: Vec<String>,
}

impl Skill {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Parse `<skill_dir>/SKILL.md` and index its `references/` and `scripts/`.
pub fn parse_skill(skill_dir: &Path) -> Result<Skill> {
    let skill_md_path = skill_dir.join(SKILL_FILE);
    if !skill_md_path.is_file() {
        bail!("missing {SKILL_FILE} in {}", skill_dir.display());
    }
    let raw = fs::read_to_string(&skill_md_path)
        .with_context(|| format!("read {}", skill_md_path.display()))?;
    let raw = raw.replace("\r\n", "\n");
    let (frontmatter, body) = split_frontmatter(&raw)
        .with_context(|| format!("parse frontmatter {}", skill_md_path.display()))?;

    let name = scalar_string(frontmatter.get("name")).unwrap_or_default();
    if name.is_empty() {
        bail!(
            "skill frontmatter must include non-empty 'name' in {}",
            skill_md_path.display()
        );
    }
    let description = scalar_string(frontmatter.get("description")).unwrap_or_default();
    if description.is_empty() {
        bail!(
            "skill frontmatter must include non-empty 'description' in {}",
            skill_md_path.display()
        );
    }

    let references = index_relative_files(&skill_dir.join("references"), skill_dir)?;
    let scripts = index_relative_files(&skill_dir.join("scripts"), skill_dir)?;
    let metadata = SkillMetadata {
        name,
        description,
        tags: string_list(frontmatter.get("tags")),
        version: scalar_string(frontmatter.get("version"))
            .filter(|version| !version.is_empty())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        allowed_tools: string_list(frontmatter.get("allowed_tools")),
        references_index: references.clone(),
        action_aliases: string_map(frontmatter.get("action_aliases")),
        default_action_params: params_table(frontmatter.get("default_action_params")),
    };

    Ok(Skill {
        metadata,
        skill_dir: skill_dir.to_path_buf(),
        skill_md_path,
        sections: parse_sections(body),
        body: body.to_string(),
        references,
        scripts,
    })
}

fn split_frontmatter(raw: &str) -> Result<(Mapping, &str)> {
    let rest = raw
        .strip_prefix(FRONTMATTER_START)
        .ok_or_else(|| anyhow!("missing YAML frontmatter start delimiter"))?;
    // The closing marker may directly follow the opening one (empty frontmatter).
    let (yaml, body) = if let Some(body) = rest.strip_prefix("---\n") {
        ("", body)
    } else {
        let end = rest
            .find(FRONTMATTER_END)
            .ok_or_else(|| anyhow!("missing YAML frontmatter end delimiter"))?;
        (&rest[..end], &rest[end + FRONTMATTER_END.len()..])
    };
    let value: YamlValue = serde_yaml::from_str(yaml).context("parse YAML frontmatter")?;
    match value {
        YamlValue::Null => Ok((Mapping::new(), body)),
        YamlValue::Mapping(mapping) => Ok((mapping, body)),
        _ => bail!("frontmatter must be a mapping"),
    }
}

/// Split a markdown body on heading lines, preserving order.
pub fn parse_sections(body: &str) -> Vec<SkillSection> {
    let mut sections: Vec<SkillSection> = Vec::new();
    let mut push = |title: String, lines: &[&str]| {
        let content = lines.join("\n").trim().to_string();
        if let Some(existing) = sections.iter_mut().find(|section| section.title == title) {
            existing.content = content;
        } else {
            sections.push(SkillSection { title, content });
        }
    };

    let mut current = "Overview".to_string();
    let mut buffer: Vec<&str> = Vec::new();
    for line in body.lines() {
        if line.starts_with('#') {
            push(std::mem::take(&mut current), &buffer);
            let title = line.trim_start_matches('#').trim();
            current = if title.is_empty() {
                "Untitled".to_string()
            } else {
                title.to_string()
            };
            buffer.clear();
        } else {
            buffer.push(line);
        }
    }
    push(current, &buffer);
    sections.retain(|section| !section.content.is_empty());
    sections
}

/// Sorted file paths under `dir`, relative to `skill_dir`, `/`-separated.
fn index_relative_files(dir: &Path, skill_dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if dir.is_dir() {
        collect_files(dir, &mut files)?;
    }
    files.sort();
    Ok(files
        .iter()
        .filter_map(|path| path.strip_prefix(skill_dir).ok())
        .map(|rel| {
            rel.components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn scalar_string(value: Option<&YamlValue>) -> Option<String> {
    match value? {
        YamlValue::String(text) => Some(text.trim().to_string()),
        YamlValue::Number(number) => Some(number.to_string()),
        YamlValue::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&YamlValue>) -> Vec<String> {
    match value {
        Some(YamlValue::Sequence(items)) => items
            .iter()
            .filter_map(|item| scalar_string(Some(item)))
            .collect(),
        _ => Vec::new(),
    }
}

fn string_map(value: Option<&YamlValue>) -> BTreeMap<String, String> {
    let Some(YamlValue::Mapping(mapping)) = value else {
        return BTreeMap::new();
    };
    mapping
        .iter()
        .filter_map(|(key, value)| Some((scalar_string(Some(key))?, scalar_string(Some(value))?)))
        .collect()
}

fn params_table(value: Option<&YamlValue>) -> Vec<(String, Map<String, Value>)> {
    let Some(YamlValue::Mapping(mapping)) = value else {
        return Vec::new();
    };
    mapping
        .iter()
        .filter_map(|(key, value)| {
            let action = scalar_string(Some(key))?;
            let YamlValue::Mapping(_) = value else {
                return None;
            };
            match serde_json::to_value(value) {
                Ok(Value::Object(params)) => Some((action, params)),
                _ => None,
            }
        })
        .collect()
}
