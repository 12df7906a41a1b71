//! Layered configuration
//!
//! Priority: direct overrides > environment > file > defaults. Environment
//! variables use the `MEMORI_` prefix with `__` as the section separator
//! (e.g. `MEMORI_DATABASE__CONNECTION_STRING`). Files are JSON or TOML,
//! searched in the current directory, `config/`, the user config dir, then
//! `/etc/memori/`. Unknown keys are rejected at load time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MemoriError, Result};
use crate::types::normalize_namespace;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MEMORI_";

/// Config file basenames probed in each search-path directory
const FILE_CANDIDATES: &[&str] = &["memori.json", "memori.toml"];

/// Database section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path to the embedded database file, or a `libsql://` URL for the
    /// client-server back-end. `~` is expanded.
    pub connection_string: String,
    pub pool_size: usize,
    pub echo_sql: bool,
    pub migration_auto: bool,
    pub backup_enabled: bool,
    pub backup_interval_hours: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "memori.db".to_string(),
            pool_size: 10,
            echo_sql: false,
            migration_auto: true,
            backup_enabled: false,
            backup_interval_hours: 24,
        }
    }
}

impl DatabaseConfig {
    /// Connection string with `~` and environment references expanded.
    pub fn expanded_connection_string(&self) -> String {
        shellexpand::tilde(&self.connection_string).into_owned()
    }
}

/// Provider API flavor for the processing client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKind {
    #[default]
    Openai,
    Azure,
    Custom,
}

/// Classifier / provider section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub api_type: ApiKind,
    pub api_key: Option<String>,
    /// Base URL for `custom` (any OpenAI-compatible endpoint, e.g. Ollama)
    pub base_url: Option<String>,
    pub model: String,
    pub azure_endpoint: Option<String>,
    pub azure_deployment: Option<String>,
    pub api_version: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    /// Per-call timeout in seconds
    pub timeout: u64,
    pub max_retries: u32,
    pub default_headers: HashMap<String, String>,
    pub default_query: HashMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_type: ApiKind::Openai,
            api_key: None,
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            azure_endpoint: None,
            azure_deployment: None,
            api_version: None,
            organization: None,
            project: None,
            timeout: 30,
            max_retries: 3,
            default_headers: HashMap::new(),
            default_query: HashMap::new(),
        }
    }
}

/// Retention policy for the long-term sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RetentionPolicy {
    #[serde(rename = "7_days")]
    Days7,
    #[default]
    #[serde(rename = "30_days")]
    Days30,
    #[serde(rename = "90_days")]
    Days90,
    #[serde(rename = "permanent")]
    Permanent,
}

impl RetentionPolicy {
    /// Maximum age in days for swept long-term rows; None = never swept.
    pub fn max_age_days(&self) -> Option<i64> {
        match self {
            RetentionPolicy::Days7 => Some(7),
            RetentionPolicy::Days30 => Some(30),
            RetentionPolicy::Days90 => Some(90),
            RetentionPolicy::Permanent => None,
        }
    }
}

/// Memory section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySettings {
    pub namespace: String,
    pub shared_memory: bool,
    pub retention_policy: RetentionPolicy,
    pub auto_cleanup: bool,
    pub importance_threshold: f32,
    pub max_short_term_memories: usize,
    pub max_long_term_memories: usize,
    pub context_injection: bool,
    /// Maximum memories injected per call
    pub context_limit: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            shared_memory: false,
            retention_policy: RetentionPolicy::Days30,
            auto_cleanup: true,
            importance_threshold: 0.3,
            max_short_term_memories: 1_000,
            max_long_term_memories: 10_000,
            context_injection: true,
            context_limit: 5,
        }
    }
}

/// Modes section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModesConfig {
    /// One-shot working-set priming at session start
    pub conscious_ingest: bool,
    /// Per-call dynamic retrieval
    pub auto_ingest: bool,
    /// Periodic analyzer refresh; 0 disables the timer
    pub analysis_interval_hours: u64,
    pub working_set_size: usize,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            conscious_ingest: false,
            auto_ingest: false,
            analysis_interval_hours: 6,
            working_set_size: 10,
        }
    }
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_file_path: Option<String>,
    pub structured_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file_path: None,
            structured_logging: false,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoriConfig {
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub memory: MemorySettings,
    pub modes: ModesConfig,
    pub logging: LoggingConfig,
}

impl MemoriConfig {
    /// Load configuration from the search path and the environment.
    ///
    /// Layering: defaults, then the first config file found, then
    /// `MEMORI_*` environment variables. Direct overrides are applied by
    /// the caller mutating the returned value before `enable`.
    pub fn load() -> Result<Self> {
        let mut value = serde_json::to_value(MemoriConfig::default())?;

        if let Some(path) = find_config_file() {
            let file_value = read_config_file(&path)?;
            merge_value(&mut value, file_value);
        }

        let env_value = env_overrides(std::env::vars());
        merge_value(&mut value, env_value);

        let config: MemoriConfig = serde_json::from_value(value)
            .map_err(|e| MemoriError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file path plus environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut value = serde_json::to_value(MemoriConfig::default())?;
        merge_value(&mut value, read_config_file(path.as_ref())?);
        merge_value(&mut value, env_overrides(std::env::vars()));

        let config: MemoriConfig = serde_json::from_value(value)
            .map_err(|e| MemoriError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints. Called during `enable` as well.
    pub fn validate(&self) -> Result<()> {
        normalize_namespace(&self.memory.namespace)
            .map_err(|e| MemoriError::Config(format!("memory.namespace: {}", e)))?;

        if self.database.connection_string.trim().is_empty() {
            return Err(MemoriError::Config(
                "database.connection_string must not be empty".to_string(),
            ));
        }
        if self.database.pool_size == 0 {
            return Err(MemoriError::Config(
                "database.pool_size must be at least 1".to_string(),
            ));
        }
        if self.memory.context_limit == 0 {
            return Err(MemoriError::Config(
                "memory.context_limit must be at least 1".to_string(),
            ));
        }
        if self.modes.working_set_size == 0 {
            return Err(MemoriError::Config(
                "modes.working_set_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory.importance_threshold) {
            return Err(MemoriError::Config(
                "memory.importance_threshold must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Probe the documented search path for a config file.
fn find_config_file() -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = vec![PathBuf::from("."), PathBuf::from("config")];
    if let Some(config_dir) = dirs::config_dir() {
        dirs.push(config_dir.join("memori"));
    }
    dirs.push(PathBuf::from("/etc/memori"));

    for dir in dirs {
        for candidate in FILE_CANDIDATES {
            let path = dir.join(candidate);
            if path.is_file() {
                return Some(path);
            }
        }
    }
    None
}

fn read_config_file(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext {
        "toml" => {
            let parsed: toml::Value = toml::from_str(&raw)
                .map_err(|e| MemoriError::Config(format!("{}: {}", path.display(), e)))?;
            serde_json::to_value(parsed).map_err(MemoriError::from)
        }
        _ => serde_json::from_str(&raw)
            .map_err(|e| MemoriError::Config(format!("{}: {}", path.display(), e))),
    }
}

/// Build a nested override object from `MEMORI_SECTION__KEY` variables.
fn env_overrides(vars: impl Iterator<Item = (String, String)>) -> serde_json::Value {
    let mut root = serde_json::Map::new();

    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some((section, field)) = rest.split_once("__") else {
            continue;
        };
        if section.is_empty() || field.is_empty() {
            continue;
        }

        let section = section.to_lowercase();
        let field = field.to_lowercase();

        let entry = root
            .entry(section)
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let serde_json::Value::Object(map) = entry {
            map.insert(field, coerce_env_value(&raw));
        }
    }

    serde_json::Value::Object(root)
}

/// Best-effort typing of an env string: bool, integer, float, else string.
fn coerce_env_value(raw: &str) -> serde_json::Value {
    match raw {
        "true" | "TRUE" | "True" => return serde_json::Value::Bool(true),
        "false" | "FALSE" | "False" => return serde_json::Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    serde_json::Value::String(raw.to_string())
}

/// Deep-merge `overlay` into `base`. Objects merge recursively; everything
/// else replaces.
fn merge_value(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_value(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Initialize the global tracing subscriber from the logging section.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| MemoriError::Config(format!("logging.level: {}", e)))?;

    if config.log_to_file {
        let path = config
            .log_file_path
            .as_deref()
            .unwrap_or("memori.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let writer = Arc::new(file);

        if config.structured_logging {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
        }
    } else if config.structured_logging {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    Ok(())
}
