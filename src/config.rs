//! Configuration module for the distillation pipeline.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML or YAML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `DISTILLERY_` and use double underscores
//! to separate nested levels:
//! - `DISTILLERY_WATCHER__DEBOUNCE_SECONDS=2` sets `watcher.debounce_seconds`
//! - `DISTILLERY_STORAGE__DATABASE_URL=sqlite:///var/lib/kb.db` sets `storage.database_url`
//! - `DISTILLERY_LLM__MODE=offline` sets `llm.mode`
//!
//! Configuration is read once at startup and is immutable afterwards.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an explicit settings file.
pub const CONFIG_PATH_ENV: &str = "DISTILLERY_CONFIG";

/// Environment variable carrying the host identifier recorded on every block.
pub const HOST_ID_ENV: &str = "HOST_ID";

/// Errors from loading or validating configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Environment variable {var} (named by {field}) is not set")]
    MissingCredential { field: String, var: String },

    #[error("Unsupported database url '{url}': {reason}")]
    UnsupportedDatabase { url: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub relations: RelationsConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProjectConfig {
    /// Project every block produced by this process belongs to
    #[serde(default = "default_project_id")]
    pub default_project_id: String,

    /// Human-readable project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    /// Absolute directories to recurse
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Top-level subdirectory names under each root to include
    #[serde(default = "default_watch_dirs")]
    pub watch_dirs: Vec<String>,

    /// File names accepted at a root's top level regardless of `watch_dirs`
    #[serde(default = "default_watch_root_files")]
    pub watch_root_files: Vec<String>,

    /// File suffixes to include
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Directory names skipped anywhere below a root
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,

    /// Quiet interval before a changed path is processed
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,

    /// Files larger than this are not distilled (0 = unlimited)
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,

    /// Periodic drift repair and missing-root retry (0 = disabled)
    #[serde(default = "default_rescan_interval_seconds")]
    pub rescan_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Connection string for the persistence backend
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmMode {
    /// Model-backed roles call an OpenAI-compatible endpoint
    Remote,
    /// Deterministic heuristics, no network access
    Offline,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_mode")]
    pub mode: LlmMode,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_chat_model")]
    pub model_distill: String,

    #[serde(default = "default_chat_model")]
    pub model_summary: String,

    #[serde(default = "default_chat_model")]
    pub model_relation: String,

    #[serde(default = "default_chat_model")]
    pub model_arbitrate: String,

    /// Bodies longer than this (in characters) are summarized
    #[serde(default = "default_summary_threshold_chars")]
    pub summary_threshold_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Local ONNX models through fastembed
    #[serde(rename = "fastembed")]
    FastEmbed,
    /// OpenAI-compatible `/embeddings` endpoint
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Expected vector length; vectors of any other length are rejected
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// How often blocks persisted without a vector are retried (0 = disabled)
    #[serde(default = "default_reembed_interval_seconds")]
    pub reembed_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelationsConfig {
    /// Minimum cosine similarity for a neighbour to be considered related
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Number of paths processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout applied to every external call attempt
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,

    /// How long shutdown waits for in-flight pipelines
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for all targets
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

// Default value functions
fn default_project_id() -> String {
    "global".to_string()
}
fn default_watch_dirs() -> Vec<String> {
    [
        "docs",
        "doc",
        "specs",
        "requirements",
        "progress",
        "notes",
        "design",
        "architecture",
        "insights",
        "lessons",
        "postmortem",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_watch_root_files() -> Vec<String> {
    [
        "README.md",
        "TASKS.md",
        "CHANGELOG.md",
        "TODO.md",
        "NOTES.md",
        "DESIGN.md",
        "ARCHITECTURE.md",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_extensions() -> Vec<String> {
    [".md", ".markdown", ".txt", ".rst", ".adoc", ".org"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_ignore_dirs() -> Vec<String> {
    [
        "node_modules",
        "__pycache__",
        "venv",
        "env",
        "dist",
        "build",
        "target",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_debounce_seconds() -> u64 {
    1
}
fn default_max_file_size_kb() -> u64 {
    2048
}
fn default_rescan_interval_seconds() -> u64 {
    600
}
fn default_database_url() -> String {
    "sqlite://.distillery/knowledge.db".to_string()
}
fn default_llm_mode() -> LlmMode {
    LlmMode::Remote
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_summary_threshold_chars() -> usize {
    800
}
fn default_embedding_provider() -> EmbeddingProvider {
    EmbeddingProvider::FastEmbed
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_embedding_dimension() -> usize {
    384
}
fn default_embedding_batch_size() -> usize {
    32
}
fn default_reembed_interval_seconds() -> u64 {
    300
}
fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_max_neighbors() -> usize {
    3
}
fn default_workers() -> usize {
    num_cpus::get()
}
fn default_call_timeout_seconds() -> u64 {
    60
}
fn default_shutdown_grace_seconds() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            default_project_id: default_project_id(),
            name: None,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            watch_dirs: default_watch_dirs(),
            watch_root_files: default_watch_root_files(),
            extensions: default_extensions(),
            ignore_dirs: default_ignore_dirs(),
            debounce_seconds: default_debounce_seconds(),
            max_file_size_kb: default_max_file_size_kb(),
            rescan_interval_seconds: default_rescan_interval_seconds(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: default_llm_mode(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model_distill: default_chat_model(),
            model_summary: default_chat_model(),
            model_relation: default_chat_model(),
            model_arbitrate: default_chat_model(),
            summary_threshold_chars: default_summary_threshold_chars(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            reembed_interval_seconds: default_reembed_interval_seconds(),
        }
    }
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            max_neighbors: default_max_neighbors(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            call_timeout_seconds: default_call_timeout_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: BTreeMap::new(),
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds)
    }

    /// Maximum file size in bytes, `None` when unlimited.
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        (self.max_file_size_kb > 0).then(|| self.max_file_size_kb * 1024)
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Where the knowledge store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

impl StorageConfig {
    /// Resolve `database_url` into a concrete location.
    ///
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, `sqlite::memory:`, `:memory:` and
    /// bare filesystem paths.
    pub fn location(&self) -> Result<DatabaseLocation, ConfigError> {
        parse_database_url(&self.database_url)
    }
}

pub fn parse_database_url(raw: &str) -> Result<DatabaseLocation, ConfigError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(ConfigError::invalid("storage.database_url", "must not be empty"));
    }

    let rest = if let Some(rest) = url.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = url.strip_prefix("sqlite:") {
        rest
    } else if let Some((scheme, _)) = url.split_once("://") {
        return Err(ConfigError::UnsupportedDatabase {
            url: url.to_string(),
            reason: format!("scheme '{scheme}' is not supported, use sqlite"),
        });
    } else {
        url
    };

    // Drop connection options such as `?mode=rwc`
    let rest = rest.split('?').next().unwrap_or(rest);

    match rest {
        "" => Err(ConfigError::invalid("storage.database_url", "missing database path")),
        ":memory:" => Ok(DatabaseLocation::Memory),
        path => Ok(DatabaseLocation::File(PathBuf::from(path))),
    }
}

/// Identifier of the machine producing blocks.
///
/// Reads `HOST_ID`, falling back to the system hostname.
pub fn host_identifier() -> String {
    if let Ok(value) = std::env::var(HOST_ID_ENV) {
        let value = value.trim();
        if !value.is_empty() {
            return value.to_string();
        }
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

impl Settings {
    /// Load configuration from all sources.
    ///
    /// An explicit path wins, then `DISTILLERY_CONFIG`, then the nearest
    /// `.distillery/settings.toml` or `config/settings.yaml` above the current
    /// directory, then the user config directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(Self::find_workspace_config)
            .or_else(Self::find_user_config);

        if let Some(path) = &config_path {
            tracing::debug!(target: "config", "loading settings from {}", path.display());
        }

        let settings = Self::extract(config_path.as_deref())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load configuration from a specific file, without validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::extract(Some(path.as_ref()))
    }

    fn extract(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));

        if let Some(path) = path {
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            figment = if is_yaml {
                figment.merge(Yaml::file(path))
            } else {
                figment.merge(Toml::file(path))
            };
        }

        figment
            .merge(
                Env::prefixed("DISTILLERY_")
                    .ignore(&["CONFIG"])
                    .map(|key| key.as_str().to_lowercase().replace("__", ".").into()),
            )
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Find the nearest workspace settings file searching from the current directory up.
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let toml = ancestor.join(".distillery").join("settings.toml");
            if toml.is_file() {
                return Some(toml);
            }
            let yaml = ancestor.join("config").join("settings.yaml");
            if yaml.is_file() {
                return Some(yaml);
            }
        }

        None
    }

    fn find_user_config() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("distillery").join("settings.toml");
        path.is_file().then_some(path)
    }

    /// Check every constraint the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.default_project_id.trim().is_empty() {
            return Err(ConfigError::invalid(
                "project.default_project_id",
                "must not be empty",
            ));
        }

        if self.watcher.roots.is_empty() {
            return Err(ConfigError::invalid(
                "watcher.roots",
                "at least one root is required",
            ));
        }
        for root in &self.watcher.roots {
            if !root.is_absolute() {
                return Err(ConfigError::invalid(
                    "watcher.roots",
                    format!("{} is not an absolute path", root.display()),
                ));
            }
        }
        if self.watcher.extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "watcher.extensions",
                "at least one extension is required",
            ));
        }

        self.storage.location()?;

        if self.llm.mode == LlmMode::Remote {
            let models = [
                ("llm.model_distill", &self.llm.model_distill),
                ("llm.model_summary", &self.llm.model_summary),
                ("llm.model_relation", &self.llm.model_relation),
                ("llm.model_arbitrate", &self.llm.model_arbitrate),
            ];
            for (field, model) in models {
                if model.trim().is_empty() {
                    return Err(ConfigError::invalid(field, "model identifier is empty"));
                }
            }
            require_env("llm.api_key_env", &self.llm.api_key_env)?;
        }

        if self.embedding.model.trim().is_empty() {
            return Err(ConfigError::invalid("embedding.model", "must not be empty"));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::invalid("embedding.dimension", "must be positive"));
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::invalid("embedding.batch_size", "must be positive"));
        }
        if self.embedding.provider == EmbeddingProvider::OpenAi {
            require_env("embedding.api_key_env", &self.embedding.api_key_env)?;
        }

        if !(0.0..=1.0).contains(&self.relations.similarity_threshold) {
            return Err(ConfigError::invalid(
                "relations.similarity_threshold",
                "must be within 0.0..=1.0",
            ));
        }

        if self.pipeline.workers == 0 {
            return Err(ConfigError::invalid("pipeline.workers", "must be at least 1"));
        }
        if self.pipeline.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "pipeline.retry.max_attempts",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Serialize the effective settings for display.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn require_env(field: &str, var: &str) -> Result<(), ConfigError> {
    let var = var.trim();
    if var.is_empty() {
        return Err(ConfigError::invalid(field, "variable name is empty"));
    }
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::MissingCredential {
            field: field.to_string(),
            var: var.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn offline_settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.watcher.roots = vec![root.to_path_buf()];
        settings.llm.mode = LlmMode::Offline;
        settings.storage.database_url = ":memory:".to_string();
        settings
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.project.default_project_id, "global");
        assert_eq!(settings.watcher.debounce_seconds, 1);
        assert!(settings.watcher.extensions.contains(&".md".to_string()));
        assert_eq!(settings.embedding.provider, EmbeddingProvider::FastEmbed);
        assert!(settings.pipeline.workers > 0);
        assert_eq!(settings.llm.summary_threshold_chars, 800);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
[project]
default_project_id = "kb"

[watcher]
roots = ["/srv/notes"]
watch_dirs = ["docs"]
extensions = [".md"]
debounce_seconds = 3

[storage]
database_url = "sqlite:///var/lib/kb.db"

[llm]
mode = "offline"
model_distill = "qwen-plus"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.project.default_project_id, "kb");
        assert_eq!(settings.watcher.roots, vec![PathBuf::from("/srv/notes")]);
        assert_eq!(settings.watcher.watch_dirs, vec!["docs"]);
        assert_eq!(settings.watcher.debounce_seconds, 3);
        assert_eq!(settings.llm.mode, LlmMode::Offline);
        assert_eq!(settings.llm.model_distill, "qwen-plus");
        // Untouched sections keep defaults
        assert_eq!(settings.llm.model_summary, "gpt-4o-mini");
        assert_eq!(
            settings.storage.location().unwrap(),
            DatabaseLocation::File(PathBuf::from("/var/lib/kb.db"))
        );
    }

    #[test]
    fn test_load_from_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.yaml");

        let yaml_content = r#"
project:
  default_project_id: notes
watcher:
  roots: ["/data/projects"]
  debounce_seconds: 0
embedding:
  provider: openai
  model: text-embedding-3-small
  dimension: 1536
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.project.default_project_id, "notes");
        assert_eq!(settings.watcher.debounce_seconds, 0);
        assert_eq!(settings.embedding.provider, EmbeddingProvider::OpenAi);
        assert_eq!(settings.embedding.dimension, 1536);
    }

    #[test]
    fn test_unknown_embedding_provider_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        fs::write(&config_path, "[embedding]\nprovider = \"word2vec\"\n").unwrap();

        let err = Settings::load_from(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        fs::write(&config_path, "[relations]\nmax_neighbors = 2\n").unwrap();

        unsafe {
            std::env::set_var("DISTILLERY_RELATIONS__MAX_NEIGHBORS", "7");
        }
        let settings = Settings::load_from(&config_path).unwrap();
        unsafe {
            std::env::remove_var("DISTILLERY_RELATIONS__MAX_NEIGHBORS");
        }

        assert_eq!(settings.relations.max_neighbors, 7);
    }

    #[test]
    fn test_validate_accepts_offline_settings() {
        let temp_dir = TempDir::new().unwrap();
        let settings = offline_settings(temp_dir.path());
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_relative_root() {
        let mut settings = offline_settings(Path::new("/tmp"));
        settings.watcher.roots = vec![PathBuf::from("notes")];

        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "watcher.roots"));
    }

    #[test]
    fn test_validate_requires_roots() {
        let mut settings = offline_settings(Path::new("/tmp"));
        settings.watcher.roots.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_remote_mode_requires_credential() {
        let mut settings = offline_settings(Path::new("/tmp"));
        settings.llm.mode = LlmMode::Remote;
        settings.llm.api_key_env = "DISTILLERY_TEST_KEY_THAT_IS_NOT_SET".to_string();

        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential { .. }));
    }

    #[test]
    fn test_parse_database_url_variants() {
        assert_eq!(parse_database_url(":memory:").unwrap(), DatabaseLocation::Memory);
        assert_eq!(
            parse_database_url("sqlite::memory:").unwrap(),
            DatabaseLocation::Memory
        );
        assert_eq!(
            parse_database_url("sqlite://kb.db?mode=rwc").unwrap(),
            DatabaseLocation::File(PathBuf::from("kb.db"))
        );
        assert_eq!(
            parse_database_url("/var/lib/kb.db").unwrap(),
            DatabaseLocation::File(PathBuf::from("/var/lib/kb.db"))
        );
        assert!(matches!(
            parse_database_url("postgresql://user@localhost/kb"),
            Err(ConfigError::UnsupportedDatabase { .. })
        ));
        assert!(parse_database_url("  ").is_err());
    }

    #[test]
    fn test_max_file_size_zero_means_unlimited() {
        let mut watcher = WatcherConfig::default();
        assert_eq!(watcher.max_file_size_bytes(), Some(2048 * 1024));
        watcher.max_file_size_kb = 0;
        assert_eq!(watcher.max_file_size_bytes(), None);
    }
}
