//! Configuration.
//!
//! `.conductor/conductor.toml` is parsed into [`ConductorToml`]; environment
//! variables override the file, and CLI flags override both. [`Config`] is the
//! resolved runtime view handed to the orchestrator.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::{
    ContextEstimate, DEFAULT_CONTEXT_THRESHOLD, DEFAULT_TOOL_CALL_THRESHOLD, DEFAULT_WINDOW_TOKENS,
};

pub const CONDUCTOR_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "conductor.toml";

pub const ENV_WORKER_CMD: &str = "CONDUCTOR_WORKER_CMD";
pub const ENV_SKIP_PERMISSIONS: &str = "CONDUCTOR_SKIP_PERMISSIONS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,
    /// Arguments placed before the protocol flags
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_progress_command")]
    pub progress_command: String,
}

fn default_worker_command() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_progress_command() -> String {
    "conductor progress".to_string()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            skip_permissions: true,
            timeout_secs: default_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            progress_command: default_progress_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Percent of the window that triggers a restart; 100 disables
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Tool calls that trigger a restart; 0 disables
    #[serde(default = "default_tool_call_threshold")]
    pub tool_call_threshold: u32,
    #[serde(default = "default_window_tokens")]
    pub window_tokens: u64,
}

fn default_threshold() -> f64 {
    DEFAULT_CONTEXT_THRESHOLD
}

fn default_tool_call_threshold() -> u32 {
    DEFAULT_TOOL_CALL_THRESHOLD
}

fn default_window_tokens() -> u64 {
    DEFAULT_WINDOW_TOKENS
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            tool_call_threshold: default_tool_call_threshold(),
            window_tokens: default_window_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_restarts() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_restarts: default_max_restarts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub on_restart: bool,
    /// Placeholders: `{glyph}`, `{id}`, `{title}`, `{outcome}`
    #[serde(default = "default_commit_message")]
    pub message: String,
}

fn default_commit_message() -> String {
    "[conductor] {glyph} phase {id}: {title}".to_string()
}

impl Default for CommitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            on_failure: false,
            on_restart: true,
            message: default_commit_message(),
        }
    }
}

impl CommitSection {
    pub fn render(&self, glyph: &str, id: &str, title: &str, outcome: &str) -> String {
        self.message
            .replace("{glyph}", glyph)
            .replace("{id}", id)
            .replace("{title}", title)
            .replace("{outcome}", outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSection {
    /// Headings every notes output must contain
    #[serde(default = "default_required_sections")]
    pub required_sections: Vec<String>,
    #[serde(default = "default_gate_timeout_secs")]
    pub gate_timeout_secs: u64,
}

fn default_required_sections() -> Vec<String> {
    vec!["## Summary".to_string()]
}

fn default_gate_timeout_secs() -> u64 {
    600
}

impl Default for ComplianceSection {
    fn default() -> Self {
        Self {
            required_sections: default_required_sections(),
            gate_timeout_secs: default_gate_timeout_secs(),
        }
    }
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub commit: CommitSection,
    #[serde(default)]
    pub compliance: ComplianceSection,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `.conductor/conductor.toml`, or defaults when it does not exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let path = conductor_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup(ENV_WORKER_CMD).filter(|c| !c.trim().is_empty()) {
            self.worker.command = cmd;
        }
        if let Some(value) = lookup(ENV_SKIP_PERMISSIONS) {
            self.worker.skip_permissions = value != "false";
        }
    }

    /// Problems that would make a run behave surprisingly.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0.0..=100.0).contains(&self.context.threshold) {
            warnings.push(format!(
                "context.threshold {} is outside 0-100",
                self.context.threshold
            ));
        }
        if self.context.window_tokens == 0 {
            warnings.push("context.window_tokens must be positive".to_string());
        }
        if self.worker.timeout_secs == 0 {
            warnings.push("worker.timeout_secs of 0 times out every session".to_string());
        }
        warnings
    }
}

/// Runtime configuration with resolved paths.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub plan_file: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub settings: ConductorToml,
}

impl Config {
    /// Resolve configuration for `project_dir`: file, then `.env` and the
    /// process environment.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let mut settings = ConductorToml::load_or_default(&conductor_dir)?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(Self::with_settings(project_dir, settings, verbose))
    }

    pub fn with_settings(project_dir: PathBuf, settings: ConductorToml, verbose: bool) -> Self {
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        Self {
            plan_file: conductor_dir.join("phases.json"),
            db_path: conductor_dir.join("state.db"),
            log_dir: conductor_dir.join("logs"),
            conductor_dir,
            project_dir,
            verbose,
            settings,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Configured arguments followed by the protocol flags.
    pub fn worker_args(&self) -> Vec<String> {
        let mut flags = self.settings.worker.args.clone();
        if self.settings.worker.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.worker.timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.settings.worker.stop_grace_secs)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.compliance.gate_timeout_secs)
    }

    /// Fresh estimator for one session.
    pub fn context_estimate(&self) -> ContextEstimate {
        let c = &self.settings.context;
        ContextEstimate::new(c.window_tokens, c.threshold, c.tool_call_threshold)
    }

    /// Per-attempt stream log path.
    pub fn attempt_log_path(&self, phase_id: &str, attempt: u32) -> PathBuf {
        self.log_dir
            .join(format!("phase-{}-attempt-{}.jsonl", phase_id, attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_sections_missing() {
        let toml = ConductorToml::parse("").unwrap();
        assert_eq!(toml.worker.command, "claude");
        assert_eq!(toml.worker.timeout_secs, 3600);
        assert_eq!(toml.context.threshold, 80.0);
        assert_eq!(toml.context.tool_call_threshold, 100);
        assert_eq!(toml.retry.max_retries, 2);
        assert_eq!(toml.retry.max_restarts, 3);
        assert!(toml.commit.enabled);
        assert!(!toml.commit.on_failure);
        assert_eq!(toml.compliance.required_sections, vec!["## Summary"]);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let toml = ConductorToml::parse(
            r#"
[retry]
max_retries = 5

[context]
threshold = 100.0
"#,
        )
        .unwrap();
        assert_eq!(toml.retry.max_retries, 5);
        assert_eq!(toml.retry.max_restarts, 3);
        assert_eq!(toml.context.threshold, 100.0);
        assert_eq!(toml.context.window_tokens, 200_000);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(ConductorToml::parse("[retry\nmax_retries = ").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = ConductorToml::parse("[worker]\ncommand = \"agent\"").unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_WORKER_CMD, "/opt/worker"),
            (ENV_SKIP_PERMISSIONS, "false"),
        ]
        .into_iter()
        .collect();
        toml.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(toml.worker.command, "/opt/worker");
        assert!(!toml.worker.skip_permissions);
    }

    #[test]
    fn test_blank_env_command_ignored() {
        let mut toml = ConductorToml::default();
        toml.apply_env(|k| (k == ENV_WORKER_CMD).then(|| "  ".to_string()));
        assert_eq!(toml.worker.command, "claude");
    }

    #[test]
    fn test_commit_message_template() {
        let commit = CommitSection::default();
        assert_eq!(
            commit.render("✓", "02", "Auth", "completed"),
            "[conductor] ✓ phase 02: Auth"
        );
    }

    #[test]
    fn test_validate_flags_bad_threshold() {
        let mut toml = ConductorToml::default();
        assert!(toml.validate().is_empty());
        toml.context.threshold = 150.0;
        assert_eq!(toml.validate().len(), 1);
    }

    #[test]
    fn test_config_paths_and_worker_args() {
        let mut settings = ConductorToml::default();
        settings.worker.args = vec!["--model".into(), "opus".into()];
        let config = Config::with_settings(PathBuf::from("/proj"), settings, false);
        assert_eq!(config.plan_file, PathBuf::from("/proj/.conductor/phases.json"));
        assert_eq!(config.db_path, PathBuf::from("/proj/.conductor/state.db"));
        assert_eq!(
            config.attempt_log_path("03", 2),
            PathBuf::from("/proj/.conductor/logs/phase-03-attempt-2.jsonl")
        );
        let args = config.worker_args();
        assert_eq!(&args[..2], &["--model", "opus"]);
        assert_eq!(args[2], "--dangerously-skip-permissions");
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn test_load_reads_conductor_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(CONDUCTOR_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONDUCTOR_DIR).join(CONFIG_FILE),
            "[retry]\nmax_restarts = 1\n",
        )
        .unwrap();
        let config = Config::load(dir.path(), true).unwrap();
        assert_eq!(config.settings.retry.max_restarts, 1);
        assert!(config.verbose);
    }
}
