//! Unified configuration for Anvil.
//!
//! Settings are read once at startup from `.anvil/anvil.toml`, then layered
//! with environment and CLI overrides by the caller. Nothing below the CLI
//! reads the environment: the build-relevant part is frozen into a
//! [`BuildConfig`] when a factory is created and travels with it from then on.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".anvil/anvil.db"
//!
//! [build]
//! max_iterations = 5
//! plan_retry_limit = 2
//!
//! [build.timeouts]
//! plan_secs = 120
//! synthesize_secs = 300
//! validate_secs = 300
//! test_secs = 600
//!
//! [workspace]
//! root = ".anvil/workspaces"
//!
//! [validation.lint]
//! program = "cargo"
//! args = ["check", "--message-format", "short"]
//!
//! [validation.test]
//! program = "cargo"
//! args = ["test"]
//!
//! [reasoning]
//! endpoint = "http://127.0.0.1:8080"
//! transient_retries = 3
//!
//! [escalation]
//! webhook_url = "https://review.example.com/hooks/anvil"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const CONFIG_FILE_NAME: &str = "anvil.toml";
pub const ANVIL_DIR_NAME: &str = ".anvil";

// ── [server] ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for local dashboard development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".anvil/anvil.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

// ── [build] ──────────────────────────────────────────────────────────

/// Per-step timeouts for collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTimeouts {
    #[serde(default = "default_plan_secs")]
    pub plan_secs: u64,
    #[serde(default = "default_synthesize_secs")]
    pub synthesize_secs: u64,
    #[serde(default = "default_validate_secs")]
    pub validate_secs: u64,
    #[serde(default = "default_test_secs")]
    pub test_secs: u64,
}

fn default_plan_secs() -> u64 {
    120
}

fn default_synthesize_secs() -> u64 {
    300
}

fn default_validate_secs() -> u64 {
    300
}

fn default_test_secs() -> u64 {
    600
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            plan_secs: default_plan_secs(),
            synthesize_secs: default_synthesize_secs(),
            validate_secs: default_validate_secs(),
            test_secs: default_test_secs(),
        }
    }
}

impl StepTimeouts {
    pub fn plan(&self) -> Duration {
        Duration::from_secs(self.plan_secs)
    }

    pub fn synthesize(&self) -> Duration {
        Duration::from_secs(self.synthesize_secs)
    }

    pub fn validate(&self) -> Duration {
        Duration::from_secs(self.validate_secs)
    }

    pub fn test(&self) -> Duration {
        Duration::from_secs(self.test_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_plan_retry_limit")]
    pub plan_retry_limit: u32,
    #[serde(default)]
    pub timeouts: StepTimeouts,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_plan_retry_limit() -> u32 {
    2
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            plan_retry_limit: default_plan_retry_limit(),
            timeouts: StepTimeouts::default(),
        }
    }
}

// ── [workspace] ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".anvil/workspaces")
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

// ── [validation] ─────────────────────────────────────────────────────

/// A command run inside a snapshot checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProfile {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard kill deadline for the process itself.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    300
}

impl CommandProfile {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs: default_command_timeout(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default = "default_lint_profile")]
    pub lint: CommandProfile,
    #[serde(default = "default_test_profile")]
    pub test: CommandProfile,
}

fn default_lint_profile() -> CommandProfile {
    CommandProfile::new("cargo", &["check", "--message-format", "short"])
}

fn default_test_profile() -> CommandProfile {
    CommandProfile::new("cargo", &["test"])
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            lint: default_lint_profile(),
            test: default_test_profile(),
        }
    }
}

// ── [reasoning] ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Retries for transient failures, on top of the first call.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_transient_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            transient_retries: default_transient_retries(),
            backoff_ms: default_backoff_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ── [escalation] ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationSection {
    /// Out-of-band review channel. Events are always broadcast locally.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

// ── [logging] ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written as JSON to a daily-rotated file here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            log_dir: None,
        }
    }
}

// ── Build configuration captured per factory ─────────────────────────

/// Everything the repair loop and validation runner need, captured when a
/// factory is created and threaded explicitly through every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub max_iterations: u32,
    pub plan_retry_limit: u32,
    pub timeouts: StepTimeouts,
    pub workspace_root: PathBuf,
    pub lint: CommandProfile,
    pub test: CommandProfile,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let build = BuildSection::default();
        let validation = ValidationSection::default();
        Self {
            max_iterations: build.max_iterations,
            plan_retry_limit: build.plan_retry_limit,
            timeouts: build.timeouts,
            workspace_root: default_workspace_root(),
            lint: validation.lint,
            test: validation.test,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let t = &self.timeouts;
        if [t.plan_secs, t.synthesize_secs, t.validate_secs, t.test_secs].contains(&0) {
            return Err(ConfigError::Invalid(
                "step timeouts must be greater than zero".to_string(),
            ));
        }
        if self.lint.program.trim().is_empty() || self.test.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "validation command programs must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ── anvil.toml ───────────────────────────────────────────────────────

/// The complete anvil.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnvilToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AnvilToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from(CONFIG_FILE_NAME),
            message: e.to_string(),
        })
    }

    /// Load from `<anvil_dir>/anvil.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(anvil_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = anvil_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let content = toml::to_string_pretty(self).context("Failed to serialize anvil.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// The build configuration new factories start from.
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            max_iterations: self.build.max_iterations,
            plan_retry_limit: self.build.plan_retry_limit,
            timeouts: self.build.timeouts.clone(),
            workspace_root: self.workspace.root.clone(),
            lint: self.validation.lint.clone(),
            test: self.validation.test.clone(),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.build_config().validate() {
            warnings.push(e.to_string());
        }
        if self.build.max_iterations > 50 {
            warnings.push(format!(
                "max_iterations = {} is unusually high; escalations will take a long time",
                self.build.max_iterations
            ));
        }
        if !(self.reasoning.endpoint.starts_with("http://")
            || self.reasoning.endpoint.starts_with("https://"))
        {
            warnings.push(format!(
                "reasoning.endpoint '{}' should be an http(s) URL",
                self.reasoning.endpoint
            ));
        }
        if let Some(url) = &self.escalation.webhook_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            warnings.push(format!(
                "escalation.webhook_url '{}' should be an http(s) URL",
                url
            ));
        }
        if let Err(e) = self.logging.level.parse::<tracing::Level>() {
            warnings.push(format!("Invalid logging.level '{}': {}", self.logging.level, e));
        }

        warnings
    }
}

/// Resolved configuration: anvil.toml plus CLI/environment overrides.
#[derive(Debug, Clone)]
pub struct AnvilConfig {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub toml: AnvilToml,
}

impl AnvilConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self, ConfigError> {
        let anvil_dir = project_dir.join(ANVIL_DIR_NAME);
        let toml = AnvilToml::load_or_default(&anvil_dir)?;
        Ok(Self {
            project_dir,
            anvil_dir,
            toml,
        })
    }

    /// Apply CLI overrides. `None` keeps the file value.
    pub fn with_overrides(
        mut self,
        host: Option<String>,
        port: Option<u16>,
        db_path: Option<PathBuf>,
        dev_mode: bool,
    ) -> Self {
        if let Some(host) = host {
            self.toml.server.host = host;
        }
        if let Some(port) = port {
            self.toml.server.port = port;
        }
        if let Some(db_path) = db_path {
            self.toml.server.db_path = db_path;
        }
        if dev_mode {
            self.toml.server.dev_mode = true;
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.anvil_dir.join(CONFIG_FILE_NAME)
    }

    /// Resolve a possibly-relative path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.server.db_path)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.resolve(&self.toml.workspace.root)
    }

    /// Build defaults for new factories, with the workspace root resolved.
    pub fn build_config(&self) -> BuildConfig {
        let mut config = self.toml.build_config();
        config.workspace_root = self.workspace_root();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = AnvilToml::default();
        assert_eq!(toml.build.max_iterations, 5);
        assert_eq!(toml.build.plan_retry_limit, 2);
        assert_eq!(toml.server.port, 3141);
        assert_eq!(toml.logging.format, LogFormat::Pretty);
        assert!(toml.escalation.webhook_url.is_none());
    }

    #[test]
    fn test_parse_partial_config_keeps_defaults() {
        let toml = AnvilToml::parse(
            r#"
[build]
max_iterations = 3

[build.timeouts]
test_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(toml.build.max_iterations, 3);
        assert_eq!(toml.build.plan_retry_limit, 2);
        assert_eq!(toml.build.timeouts.test_secs, 30);
        assert_eq!(toml.build.timeouts.plan_secs, 120);
        assert_eq!(toml.validation.test.program, "cargo");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = AnvilToml::parse("not valid toml {{{{").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut toml = AnvilToml::default();
        toml.build.max_iterations = 7;
        toml.escalation.webhook_url = Some("https://example.com/hook".into());
        toml.save(&path).unwrap();

        let loaded = AnvilToml::load(&path).unwrap();
        assert_eq!(loaded.build.max_iterations, 7);
        assert_eq!(
            loaded.escalation.webhook_url.as_deref(),
            Some("https://example.com/hook")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = AnvilToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.build.max_iterations, 5);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut toml = AnvilToml::default();
        assert!(toml.validate().is_empty());

        toml.build.max_iterations = 0;
        toml.reasoning.endpoint = "localhost:8080".into();
        toml.logging.level = "chatty".into();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3, "{:?}", warnings);
    }

    #[test]
    fn test_build_config_validate() {
        let mut config = BuildConfig::default();
        assert!(config.validate().is_ok());
        config.timeouts.validate_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_anvil_config_overrides_and_paths() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(ANVIL_DIR_NAME)).unwrap();
        std::fs::write(
            dir.path().join(ANVIL_DIR_NAME).join(CONFIG_FILE_NAME),
            "[server]\nport = 9000\n",
        )
        .unwrap();

        let config = AnvilConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.toml.server.port, 9000);

        let config = config.with_overrides(None, Some(9100), None, true);
        assert_eq!(config.toml.server.port, 9100);
        assert!(config.toml.server.dev_mode);
        assert!(config.db_path().ends_with(".anvil/anvil.db"));
        assert!(config.build_config().workspace_root.is_absolute());
    }

    #[test]
    fn test_command_profile_display() {
        let p = CommandProfile::new("cargo", &["test", "--quiet"]);
        assert_eq!(p.display(), "cargo test --quiet");
        assert_eq!(CommandProfile::new("make", &[]).display(), "make");
    }
}
