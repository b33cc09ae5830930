//! Configuration management for mailgate
//!
//! Handles loading and validation of mailgate.toml configuration files.
//!
//! # Schema Overview
//!
//! - `general`: Log level/format/file, data directory
//! - `storage`: DB path, writer queue size
//! - `gate`: Enforcement kill switch, dangerous actions, execution TTL, expiry check cadence
//! - `cache`: List TTL and sweeper timing
//!
//! All sections use `#[serde(default)]`; unknown fields are ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::ExecutionKind;

const CONFIG_FILE_NAME: &str = "mailgate.toml";

/// Main configuration structure for mailgate
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    pub gate: GateConfig,
    pub cache: CacheConfig,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format (default for interactive use)
    #[default]
    Pretty,
    /// Machine-parseable JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ParseFailed(format!(
                "invalid log format: {other} (expected 'pretty' or 'json')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,

    pub log_format: LogFormat,

    /// Optional log file path (supports ~ expansion)
    pub log_file: Option<String>,

    /// Data directory path (supports ~ expansion)
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            log_file: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    dirs::data_dir()
        .map(|d| d.join("mailgate"))
        .map_or_else(|| "~/.local/share/mailgate".to_string(), |p| path_to_string(&p))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; relative paths resolve under `general.data_dir`
    pub db_path: String,

    /// Bounded capacity of the writer thread's command queue
    pub writer_queue_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "mailgate.db".to_string(),
            writer_queue_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Kill switch; when false every action is allowed
    pub enforce: bool,

    /// Action names that require a confirmed execution record
    pub dangerous_actions: Vec<String>,

    /// How long a confirmation authorizes execution
    pub execution_ttl_secs: u64,

    pub expiry_check_interval_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            dangerous_actions: ExecutionKind::all()
                .iter()
                .map(|kind| kind.as_str().to_string())
                .collect(),
            execution_ttl_secs: 600,
            expiry_check_interval_secs: 30,
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn execution_ttl(&self) -> Duration {
        Duration::from_secs(self.execution_ttl_secs)
    }

    #[must_use]
    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cached list result
    pub list_ttl_secs: u64,

    pub sweep_interval_secs: u64,

    /// Random +/- offset applied to each sweep delay
    pub sweep_jitter_secs: u64,

    /// Rows stay this long past `expires_at` before deletion
    pub sweep_grace_secs: u64,

    pub max_delete_per_sweep: u32,

    /// Floor for the jittered sweep delay
    pub min_sweep_delay_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            list_ttl_secs: 300,
            sweep_interval_secs: 120,
            sweep_jitter_secs: 15,
            sweep_grace_secs: 300,
            max_delete_per_sweep: 1000,
            min_sweep_delay_secs: 5,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }
}

/// CLI overrides applied after env overrides
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub log_file: Option<String>,
    pub db_path: Option<String>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(ref log_level) = self.log_level {
            config.general.log_level.clone_from(log_level);
        }
        if let Some(log_format) = self.log_format {
            config.general.log_format = log_format;
        }
        if let Some(ref log_file) = self.log_file {
            config.general.log_file = Some(log_file.clone());
        }
        if let Some(ref db_path) = self.db_path {
            config.storage.db_path.clone_from(db_path);
        }
    }
}

#[derive(Debug, Default)]
struct EnvOverrides {
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    log_file: Option<String>,
    db_path: Option<String>,
    safety_enforce: Option<bool>,
    execution_ttl_secs: Option<u64>,
    expiry_sweep_secs: Option<u64>,
    cache_sweep_secs: Option<u64>,
    cache_sweep_grace_secs: Option<u64>,
    cache_sweep_jitter_secs: Option<u64>,
    max_delete_per_sweep: Option<u32>,
}

impl EnvOverrides {
    fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        Ok(Self {
            log_level: lookup("MAILGATE_LOG_LEVEL"),
            log_format: lookup("MAILGATE_LOG_FORMAT")
                .map(|v| v.parse::<LogFormat>())
                .transpose()?,
            log_file: lookup("MAILGATE_LOG_FILE"),
            db_path: lookup("MAILGATE_DB_PATH"),
            safety_enforce: lookup("MAILGATE_SAFETY_ENFORCE")
                .map(|v| parse_env_bool(&v))
                .transpose()?,
            execution_ttl_secs: parse_env_number(&lookup, "MAILGATE_EXECUTION_TTL_SECS")?,
            expiry_sweep_secs: parse_env_number(&lookup, "MAILGATE_EXPIRY_SWEEP_SECS")?,
            cache_sweep_secs: parse_env_number(&lookup, "MAILGATE_CACHE_SWEEP_SECS")?,
            cache_sweep_grace_secs: parse_env_number(&lookup, "MAILGATE_CACHE_SWEEP_GRACE_SECS")?,
            cache_sweep_jitter_secs: parse_env_number(
                &lookup,
                "MAILGATE_CACHE_SWEEP_JITTER_SECS",
            )?,
            max_delete_per_sweep: parse_env_number(&lookup, "MAILGATE_MAX_DELETE_PER_SWEEP")?,
        })
    }

    fn apply(self, config: &mut Config) {
        if let Some(log_level) = self.log_level {
            config.general.log_level = log_level;
        }
        if let Some(log_format) = self.log_format {
            config.general.log_format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.general.log_file = Some(log_file);
        }
        if let Some(db_path) = self.db_path {
            config.storage.db_path = db_path;
        }
        if let Some(enforce) = self.safety_enforce {
            config.gate.enforce = enforce;
        }
        if let Some(secs) = self.execution_ttl_secs {
            config.gate.execution_ttl_secs = secs;
        }
        if let Some(secs) = self.expiry_sweep_secs {
            config.gate.expiry_check_interval_secs = secs;
        }
        if let Some(secs) = self.cache_sweep_secs {
            config.cache.sweep_interval_secs = secs;
        }
        if let Some(secs) = self.cache_sweep_grace_secs {
            config.cache.sweep_grace_secs = secs;
        }
        if let Some(secs) = self.cache_sweep_jitter_secs {
            config.cache.sweep_jitter_secs = secs;
        }
        if let Some(max) = self.max_delete_per_sweep {
            config.cache.max_delete_per_sweep = max;
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./mailgate.toml
    /// 2. $XDG_CONFIG_HOME/mailgate/mailgate.toml or ~/.config/mailgate/mailgate.toml
    /// 3. Default values
    pub fn load() -> crate::Result<Self> {
        let cwd_config = Path::new(CONFIG_FILE_NAME);
        if cwd_config.exists() {
            return Self::load_from(cwd_config);
        }

        if let Some(dir) = dirs_config_path() {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load_from(&config_path);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Load configuration with overrides and validation
    ///
    /// Resolution order: defaults -> config file -> env -> CLI overrides.
    /// With `strict`, an explicit path that does not exist is an error.
    pub fn load_with_overrides(
        config_path: Option<&Path>,
        strict: bool,
        overrides: &ConfigOverrides,
    ) -> crate::Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                if path.exists() {
                    Self::load_from(path)?
                } else if strict {
                    return Err(ConfigError::FileNotFound(path.display().to_string()).into());
                } else {
                    Self::default()
                }
            }
            None => Self::load()?,
        };

        EnvOverrides::from_env()?.apply(&mut config);
        overrides.apply(&mut config);
        config.normalize_paths();
        config.validate()?;

        Ok(config)
    }

    /// Expand tildes in path fields
    pub fn normalize_paths(&mut self) {
        let data_dir = expand_tilde(&self.general.data_dir);
        self.general.data_dir = path_to_string(&data_dir);

        if let Some(log_file) = self.general.log_file.take() {
            self.general.log_file = Some(path_to_string(&expand_tilde(&log_file)));
        }

        let db_path = expand_tilde(&self.storage.db_path);
        self.storage.db_path = path_to_string(&db_path);
    }

    /// Database file location, resolving relative paths under the data directory
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        let db_path = PathBuf::from(&self.storage.db_path);
        if db_path.is_absolute() {
            db_path
        } else {
            PathBuf::from(&self.general.data_dir).join(db_path)
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        fn invalid(msg: impl Into<String>) -> crate::Error {
            ConfigError::ValidationError(msg.into()).into()
        }

        if self
            .general
            .log_level
            .parse::<crate::logging::LogLevel>()
            .is_err()
        {
            return Err(invalid(format!(
                "general.log_level '{}' is not one of trace, debug, info, warn, error",
                self.general.log_level
            )));
        }
        if self.storage.db_path.trim().is_empty() {
            return Err(invalid("storage.db_path must not be empty"));
        }
        if self.storage.writer_queue_size == 0 {
            return Err(invalid("storage.writer_queue_size must be >= 1"));
        }
        if self.gate.enforce && self.gate.dangerous_actions.is_empty() {
            return Err(invalid(
                "gate.dangerous_actions must not be empty while gate.enforce is true",
            ));
        }
        if self.gate.execution_ttl_secs == 0 {
            return Err(invalid("gate.execution_ttl_secs must be >= 1"));
        }
        if self.gate.expiry_check_interval_secs == 0 {
            return Err(invalid("gate.expiry_check_interval_secs must be >= 1"));
        }
        if self.cache.list_ttl_secs == 0 {
            return Err(invalid("cache.list_ttl_secs must be >= 1"));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs must be >= 1"));
        }
        if self.cache.sweep_jitter_secs >= self.cache.sweep_interval_secs {
            return Err(invalid(format!(
                "cache.sweep_jitter_secs ({}) must be less than cache.sweep_interval_secs ({})",
                self.cache.sweep_jitter_secs, self.cache.sweep_interval_secs
            )));
        }
        if self.cache.max_delete_per_sweep == 0 {
            return Err(invalid("cache.max_delete_per_sweep must be >= 1"));
        }
        if self.cache.min_sweep_delay_secs == 0 {
            return Err(invalid("cache.min_sweep_delay_secs must be >= 1"));
        }

        Ok(())
    }
}

fn dirs_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .map(|p| p.join("mailgate"))
}

/// Expand ~ to home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    PathBuf::from(path)
}

fn parse_env_bool(value: &str) -> crate::Result<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::ValidationError(format!(
            "Invalid boolean value '{value}' for environment override"
        ))
        .into()),
    }
}

fn parse_env_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> crate::Result<Option<T>> {
    lookup(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| {
                crate::Error::from(ConfigError::ValidationError(format!(
                    "Invalid numeric value '{value}' for {key}"
                )))
            })
        })
        .transpose()
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
