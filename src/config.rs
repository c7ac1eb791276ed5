use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::record::GateType;
use crate::types::{DimensionLevel, SizeLevel};

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OrcConfig {
    pub project: ProjectConfig,
    pub guardrails: GuardrailsConfig,
    pub execution: ExecutionConfig,
    pub agent: AgentConfig,
    pub gates: GatesConfig,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub completion: CompletionConfig,
    pub timeouts: TimeoutsConfig,
    pub artifact_skip: ArtifactSkipConfig,
    pub linting: LintingConfig,
    pub developer: DeveloperConfig,
}

/// Precedence-chain overrides consumed by [`crate::gate::resolve_gate_type`].
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatesConfig {
    pub task_overrides: HashMap<String, HashMap<String, GateType>>,
    pub weight_overrides: HashMap<String, HashMap<String, GateType>>,
    pub phase_overrides: HashMap<String, GateType>,
    pub enabled_phases: Vec<String>,
    pub disabled_phases: Vec<String>,
    /// Path to an optional script piped the decision JSON after evaluation.
    pub override_script: Option<String>,
    /// Consult the store's persisted per-phase gate record (link 4 of the
    /// precedence chain) between `phase_overrides` and the enabled/disabled
    /// check. Off by default so a config with no such records set behaves
    /// exactly as before this link existed.
    pub phase_gate_store_enabled: bool,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries_per_phase: u32,
    pub max_total_retries: u32,
    /// Static phase-to-retry-target map; an `ai` gate's `retry_from` is
    /// only consulted when no static entry exists for the failed phase.
    pub retry_map: HashMap<String, String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_per_phase: 2,
            max_total_retries: 5,
            retry_map: HashMap::new(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub idle_timeout_seconds: u64,
    pub turn_max_seconds: u64,
    pub idle_escalates: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 120,
            turn_max_seconds: 1800,
            idle_escalates: false,
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CompletionConfig {
    pub finalize: FinalizeConfig,
    pub ci: CiConfig,
    pub pr: PrConfig,
    pub forge: ForgeConfig,
    pub delete_branch: bool,
}

/// Server-side merge/check-run REST endpoint. `token_env` names the
/// environment variable the token is read from at call time — the token
/// itself is never stored in config.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ForgeConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub token_env: String,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            owner: String::new(),
            repo: String::new(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FinalizeConfig {
    pub sync_strategy: SyncStrategy,
    pub conflict_resolution: ConflictResolution,
    pub max_merge_retries: u32,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    #[default]
    Rebase,
    Merge,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    Agent,
    Abort,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            sync_strategy: SyncStrategy::Rebase,
            conflict_resolution: ConflictResolution::Agent,
            max_merge_retries: 3,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CiConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub timeout_minutes: u32,
    pub required_checks: Vec<String>,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_seconds: 30,
            timeout_minutes: 60,
            required_checks: Vec::new(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PrConfig {
    pub auto_create: bool,
    pub title_template: String,
    pub merge_method: MergeMethod,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl Default for PrConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            title_template: "[orc] {task_id}: {title}".to_string(),
            merge_method: MergeMethod::Squash,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub worktree_lock_seconds: u64,
    pub store_lock_seconds: u64,
    pub ci_poll_seconds: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            worktree_lock_seconds: 30,
            store_lock_seconds: 10,
            ci_poll_seconds: 1800,
        }
    }
}

/// Skips artifact capture/commit for phases listed here, per weight.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ArtifactSkipConfig {
    pub skip_phases: Vec<String>,
    pub skip_for_weights: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LintingConfig {
    pub enabled: bool,
    pub command: Option<String>,
    pub run_after_phases: Vec<String>,
}

impl Default for LintingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            run_after_phases: Vec::new(),
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeveloperConfig {
    pub verbose_transcripts: bool,
    pub keep_worktrees_on_failure: bool,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub prefix: String,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub max_size: SizeLevel,
    pub max_complexity: DimensionLevel,
    pub max_risk: DimensionLevel,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub phase_timeout_minutes: u32,
    pub max_retries: u32,
    pub default_phase_cap: u32,
    pub max_wip: u32,
    pub max_concurrent: u32,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliTool {
    #[default]
    Claude,
    OpenCode,
}

impl CliTool {
    pub fn binary_name(&self) -> &str {
        match self {
            CliTool::Claude => "claude",
            CliTool::OpenCode => "opencode",
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            CliTool::Claude => "Claude CLI",
            CliTool::OpenCode => "OpenCode CLI",
        }
    }

    pub fn build_args(&self, prompt: &str, model: Option<&str>) -> Vec<String> {
        match self {
            CliTool::Claude => {
                let mut args = vec!["--dangerously-skip-permissions".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("-p".to_string());
                args.push(prompt.to_string());
                args
            }
            CliTool::OpenCode => {
                let mut args = vec!["run".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("--quiet".to_string());
                args.push(prompt.to_string());
                args
            }
        }
    }

    pub fn version_args(&self) -> Vec<&str> {
        match self {
            CliTool::Claude => vec!["--version"],
            CliTool::OpenCode => vec!["--version"],
        }
    }

    pub fn install_hint(&self) -> &str {
        match self {
            CliTool::Claude => "Install: https://docs.anthropic.com/en/docs/claude-code",
            CliTool::OpenCode => "Install: https://github.com/opencode-ai/opencode",
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub cli: CliTool,
    pub model: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            prefix: "WRK".to_string(),
        }
    }
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_size: SizeLevel::Medium,
            max_complexity: DimensionLevel::Medium,
            max_risk: DimensionLevel::Low,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            phase_timeout_minutes: 30,
            max_retries: 2,
            default_phase_cap: 100,
            max_wip: 1,
            max_concurrent: 1,
        }
    }
}

pub fn normalize_agent_config(config: &mut OrcConfig) {
    if let Some(ref model) = config.agent.model {
        let trimmed = model.trim();
        if trimmed.is_empty() {
            config.agent.model = None;
        } else {
            config.agent.model = Some(trimmed.to_string());
        }
    }
}

pub fn validate(config: &OrcConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.max_wip < 1 {
        errors.push("execution.max_wip must be >= 1".to_string());
    }

    if config.execution.max_concurrent < 1 {
        errors.push("execution.max_concurrent must be >= 1".to_string());
    }

    if let Some(ref model) = config.agent.model {
        let is_valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
        if !is_valid {
            errors.push(
                "agent.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                    .to_string(),
            );
        } else if model.starts_with('-') {
            errors.push(
                "agent.model must not start with '-' (flag-like values are rejected)".to_string(),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to `{project_root}/phase-golem.toml`.
///
/// When `config_path` is `Some`, the file MUST exist — returns an error if missing.
/// When `config_path` is `None`, delegates to `load_config` (returns defaults if missing).
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<OrcConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

/// Load config from a specific file path. Errors if the file does not exist.
fn load_config_at(path: &Path) -> Result<OrcConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: OrcConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    normalize_agent_config(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

pub fn load_config(project_root: &Path) -> Result<OrcConfig, String> {
    let config_path = project_root.join("phase-golem.toml");

    if !config_path.exists() {
        return Ok(OrcConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let mut config: OrcConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    normalize_agent_config(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}
