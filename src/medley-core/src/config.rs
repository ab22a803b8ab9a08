use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// Configured sources keyed by source id.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            search: SearchConfig::default(),
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Fan-out search tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Per-source timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on aggregated hits returned to the caller.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Count requested from each source when the CLI doesn't override it.
    #[serde(default = "default_count")]
    pub default_count: u32,
    /// Seconds between registry rescans in follow mode.
    #[serde(default = "default_rescan_secs")]
    pub rescan_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_results: default_max_results(),
            default_count: default_count(),
            rescan_secs: default_rescan_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Filesystem,
    Plugin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceEntry {
    pub kind: SourceKind,
    /// Display name; defaults to the source id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ranking weight applied to this source's hits.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Library roots (filesystem sources).
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Plugin executable (plugin sources).
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl SourceEntry {
    pub fn filesystem(roots: Vec<PathBuf>) -> Self {
        Self {
            kind: SourceKind::Filesystem,
            name: None,
            enabled: true,
            weight: default_weight(),
            roots,
            executable: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn plugin(executable: impl Into<PathBuf>) -> Self {
        Self {
            kind: SourceKind::Plugin,
            executable: Some(executable.into()),
            ..Self::filesystem(Vec::new())
        }
    }

    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("search.timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("search.max_results must be greater than zero")]
    ZeroMaxResults,
    #[error("source '{id}' has invalid weight {weight}")]
    InvalidWeight { id: String, weight: f64 },
    #[error("filesystem source '{id}' has no roots")]
    MissingRoots { id: String },
    #[error("plugin source '{id}' has no executable")]
    MissingExecutable { id: String },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        if self.search.timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if self.search.max_results == 0 {
            return Err(ValidationError::ZeroMaxResults);
        }
        for (id, entry) in &self.sources {
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(ValidationError::InvalidWeight {
                    id: id.clone(),
                    weight: entry.weight,
                });
            }
            match entry.kind {
                SourceKind::Filesystem if entry.roots.is_empty() => {
                    return Err(ValidationError::MissingRoots { id: id.clone() });
                }
                SourceKind::Plugin if entry.executable.is_none() => {
                    return Err(ValidationError::MissingExecutable { id: id.clone() });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Ranking weights for every configured source.
    pub fn source_weights(&self) -> BTreeMap<String, f64> {
        self.sources
            .iter()
            .map(|(id, entry)| (id.clone(), entry.weight))
            .collect()
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_results() -> usize {
    50
}

fn default_count() -> u32 {
    10
}

fn default_rescan_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}
