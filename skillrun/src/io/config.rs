//! Agent configuration stored as TOML (`skillrun.toml`).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::prefilter::ZeroCandidateStrategy;
use crate::core::redaction::Scrubber;

pub const CONFIG_FILE_NAME: &str = "skillrun.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    Anthropic,
    Gemini,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
        }
    }
}

/// How decisions are requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StructuredOutputMode {
    /// Plain prompt asking for a JSON object.
    JsonOnly,
    /// Offer the decision tool; fall back to the JSON prompt if the request fails.
    #[default]
    NativeWithJsonFallback,
    /// Force the decision tool.
    NativeOnly,
}

impl StructuredOutputMode {
    pub fn uses_native_tools(self) -> bool {
        !matches!(self, StructuredOutputMode::JsonOnly)
    }

    pub fn forces_tool_use(self) -> bool {
        matches!(self, StructuredOutputMode::NativeOnly)
    }
}

/// What to do when a `run_command` step exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepFailurePolicy {
    #[default]
    RetryOnceThenFallbackThenAbort,
    Abort,
}

impl StepFailurePolicy {
    pub fn retries_once(self) -> bool {
        matches!(self, StepFailurePolicy::RetryOnceThenFallbackThenAbort)
    }
}

/// Agent configuration (TOML). Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub model: ModelConfig,
    pub runtime: RuntimeConfig,
    pub skills: SkillsConfig,
    pub logging: LoggingConfig,
    pub mcp: McpConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    pub name: String,
    pub max_tokens: u32,
    pub max_context_tokens: usize,
    pub response_headroom_tokens: usize,
    pub structured_output_mode: StructuredOutputMode,
    pub request_timeout_secs: u64,
    pub providers: ProvidersConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            name: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            max_context_tokens: 32_000,
            response_headroom_tokens: 2_000,
            structured_output_mode: StructuredOutputMode::default(),
            request_timeout_secs: 120,
            providers: ProvidersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderCredentialsConfig,
    pub gemini: ProviderCredentialsConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderCredentialsConfig {
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                auth_token_env: Some("ANTHROPIC_AUTH_TOKEN".to_string()),
            },
            gemini: ProviderCredentialsConfig {
                api_key_env: "GEMINI_API_KEY".to_string(),
                auth_token_env: None,
            },
        }
    }
}

/// Names of the environment variables holding a provider's credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProviderCredentialsConfig {
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub shell_linux: String,
    pub shell_windows: String,
    /// Per-command timeout.
    pub timeout_secs: u64,
    pub max_turns: u32,
    pub max_llm_retries: u32,
    pub retry_base_delay_secs: f64,
    pub retry_max_delay_secs: f64,
    /// Upper bound on the actual sleep between model attempts.
    pub retry_sleep_cap_secs: f64,
    pub on_step_failure: StepFailurePolicy,
    /// Consecutive executed pure self-handoffs tolerated before recovery kicks in.
    pub self_handoff_recovery_threshold: u32,
    pub command_output_limit_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shell_linux: "/bin/bash".to_string(),
            shell_windows: "pwsh".to_string(),
            timeout_secs: 120,
            max_turns: 8,
            max_llm_retries: 3,
            retry_base_delay_secs: 1.0,
            retry_max_delay_secs: 8.0,
            retry_sleep_cap_secs: 0.25,
            on_step_failure: StepFailurePolicy::default(),
            self_handoff_recovery_threshold: 1,
            command_output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SkillsConfig {
    pub dir: PathBuf,
    pub prefilter_top_k: usize,
    pub prefilter_min_score: f64,
    pub prefilter_zero_candidate_strategy: ZeroCandidateStrategy,
    pub disclosure_max_reference_bytes: usize,
    pub disclosure_max_reference_tokens: usize,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./skills"),
            prefilter_top_k: 8,
            prefilter_min_score: 55.0,
            prefilter_zero_candidate_strategy: ZeroCandidateStrategy::default(),
            disclosure_max_reference_bytes: 120_000,
            disclosure_max_reference_tokens: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub jsonl_dir: PathBuf,
    pub sanitize_control_chars: bool,
    pub redact_secrets: bool,
    pub llm_transcript_enabled: bool,
    pub llm_transcript_filename: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            jsonl_dir: PathBuf::from("./runs"),
            sanitize_control_chars: true,
            redact_secrets: true,
            llm_transcript_enabled: true,
            llm_transcript_filename: "llm_transcript.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn scrubber(&self) -> Scrubber {
        Scrubber {
            sanitize_control_chars: self.sanitize_control_chars,
            redact_secrets: self.redact_secrets,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct McpConfig {
    pub enabled: bool,
    pub tool_call_timeout_secs: u64,
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_call_timeout_secs: 60,
            servers: BTreeMap::new(),
        }
    }
}

/// A stdio MCP server launched as a child process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_server_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_server_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub max_entries: usize,
    pub max_summary_chars: usize,
    pub max_context_tokens: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_entries: 12,
            max_summary_chars: 1200,
            max_context_tokens: 3000,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.name.trim().is_empty() {
            return Err(anyhow!("model.name must be non-empty"));
        }
        if self.model.max_tokens == 0 {
            return Err(anyhow!("model.max_tokens must be > 0"));
        }
        if self.model.max_context_tokens == 0 {
            return Err(anyhow!("model.max_context_tokens must be > 0"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.runtime.timeout_secs == 0 {
            return Err(anyhow!("runtime.timeout_secs must be > 0"));
        }
        if self.runtime.max_turns == 0 {
            return Err(anyhow!("runtime.max_turns must be > 0"));
        }
        for (field, value) in [
            ("runtime.retry_base_delay_secs", self.runtime.retry_base_delay_secs),
            ("runtime.retry_max_delay_secs", self.runtime.retry_max_delay_secs),
            ("runtime.retry_sleep_cap_secs", self.runtime.retry_sleep_cap_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("{field} must be a non-negative number"));
            }
        }
        if self.runtime.command_output_limit_bytes == 0 {
            return Err(anyhow!("runtime.command_output_limit_bytes must be > 0"));
        }
        if self.skills.prefilter_top_k == 0 {
            return Err(anyhow!("skills.prefilter_top_k must be > 0"));
        }
        if !(0.0..=100.0).contains(&self.skills.prefilter_min_score) {
            return Err(anyhow!("skills.prefilter_min_score must be within 0..=100"));
        }
        let transcript = self.logging.llm_transcript_filename.trim();
        if transcript.is_empty() || transcript.contains(['/', '\\']) {
            return Err(anyhow!(
                "logging.llm_transcript_filename must be a plain file name"
            ));
        }
        for (name, server) in &self.mcp.servers {
            if server.command.trim().is_empty() {
                return Err(anyhow!("mcp.servers.{name}.command must be non-empty"));
            }
            if server.timeout_secs == 0 {
                return Err(anyhow!("mcp.servers.{name}.timeout_secs must be > 0"));
            }
        }
        if self.mcp.tool_call_timeout_secs == 0 {
            return Err(anyhow!("mcp.tool_call_timeout_secs must be > 0"));
        }
        if self.session.max_entries == 0 {
            return Err(anyhow!("session.max_entries must be > 0"));
        }
        Ok(())
    }
}

/// Config file to use: the explicit path, else `./skillrun.toml`, else the
/// user config under `~/.config/skillrun/`. `None` means built-in defaults.
pub fn discover_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = env::var_os("HOME") {
        candidates.push(
            PathBuf::from(home)
                .join(".config")
                .join("skillrun")
                .join("config.toml"),
        );
    }
    candidates.into_iter().find(|path| path.is_file())
}

/// Resolve and load the effective config. An explicit path must exist.
pub fn load_effective_config(explicit: Option<&Path>) -> Result<AgentConfig> {
    match discover_config_path(explicit) {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            debug!(path = %path.display(), "loading config");
            load_config(&path)
        }
        None => {
            let cfg = AgentConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write the default config, refusing to replace an existing file unless `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("config file already exists: {}", path.display());
    }
    write_config(path, &AgentConfig::default())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Provider credentials resolved from the environment and `.env`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub anthropic_api_key: Option<String>,
    pub anthropic_auth_token: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl Credentials {
    /// Read the configured variables, falling back to `<dir>/.env`.
    pub fn discover(model: &ModelConfig, dotenv_dir: &Path) -> Self {
        let dotenv = read_dotenv(&dotenv_dir.join(".env"));
        let lookup = |name: Option<&str>| -> Option<String> {
            let name = name.filter(|name| !name.trim().is_empty())?;
            env::var(name)
                .ok()
                .or_else(|| dotenv.get(name).cloned())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            anthropic_api_key: lookup(Some(&model.providers.anthropic.api_key_env)),
            anthropic_auth_token: lookup(model.providers.anthropic.auth_token_env.as_deref()),
            gemini_api_key: lookup(Some(&model.providers.gemini.api_key_env)),
        }
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Anthropic => {
                self.anthropic_api_key.is_some() || self.anthropic_auth_token.is_some()
            }
            Provider::Gemini => self.gemini_api_key.is_some(),
        }
    }
}

fn read_dotenv(path: &Path) -> BTreeMap<String, String> {
    let Ok(iter) = dotenvy::from_path_iter(path) else {
        return BTreeMap::new();
    };
    iter.filter_map(|item| item.ok()).collect()
}
