//! Core configuration structures and loading logic

use crate::catalog::{default_catalog, CodecCatalog};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but failed validation
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Benchmark engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Global limit on concurrent encode/measure tasks (0 = auto-derive)
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
    /// Per-sample encode timeout in seconds
    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: u64,
    /// Whole-job analysis timeout in seconds
    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,
    /// Directory receiving encoded artifacts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Keep encoded artifacts after metrics are extracted
    #[serde(default)]
    pub keep_artifacts: bool,
}

fn default_max_concurrent_tasks() -> u32 {
    2
}

fn default_encode_timeout_secs() -> u64 {
    300
}

fn default_analysis_timeout_secs() -> u64 {
    600
}

fn default_work_dir() -> PathBuf {
    env::temp_dir().join("codec-bench")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            encode_timeout_secs: default_encode_timeout_secs(),
            analysis_timeout_secs: default_analysis_timeout_secs(),
            work_dir: default_work_dir(),
            keep_artifacts: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_catalog")]
    pub codecs: CodecCatalog,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu: CpuConfig::default(),
            engine: EngineConfig::default(),
            codecs: default_catalog(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    /// - BENCH_MAX_CONCURRENT_TASKS -> engine.max_concurrent_tasks
    /// - BENCH_ENCODE_TIMEOUT_SECS -> engine.encode_timeout_secs
    /// - BENCH_ANALYSIS_TIMEOUT_SECS -> engine.analysis_timeout_secs
    /// - BENCH_WORK_DIR -> engine.work_dir
    /// - BENCH_KEEP_ARTIFACTS -> engine.keep_artifacts
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("CPU_TARGET_UTILIZATION") {
            if let Ok(util) = val.parse::<f32>() {
                self.cpu.target_cpu_utilization = util;
            }
        }

        if let Ok(val) = env::var("BENCH_MAX_CONCURRENT_TASKS") {
            if let Ok(tasks) = val.parse::<u32>() {
                self.engine.max_concurrent_tasks = tasks;
            }
        }

        if let Ok(val) = env::var("BENCH_ENCODE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.engine.encode_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("BENCH_ANALYSIS_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.engine.analysis_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("BENCH_WORK_DIR") {
            if !val.trim().is_empty() {
                self.engine.work_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BENCH_KEEP_ARTIFACTS") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.engine.keep_artifacts = true,
                "false" | "0" | "no" => self.engine.keep_artifacts = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.encode_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "engine.encode_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.engine.analysis_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "engine.analysis_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.codecs.is_empty() {
            return Err(ConfigError::Invalid(
                "codec catalog is empty".to_string(),
            ));
        }

        for (id, spec) in &self.codecs {
            if spec.encoder.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "codec '{}' has no encoder",
                    id
                )));
            }
            if !spec.extension.starts_with('.') {
                return Err(ConfigError::Invalid(format!(
                    "codec '{}' extension '{}' must start with '.'",
                    id, spec.extension
                )));
            }
            if spec.quality_range.min > spec.quality_range.max {
                return Err(ConfigError::Invalid(format!(
                    "codec '{}' quality range {} is inverted",
                    id, spec.quality_range
                )));
            }
            if spec.default_qualities.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "codec '{}' has no default qualities",
                    id
                )));
            }
            if let Some(q) = spec
                .default_qualities
                .iter()
                .find(|q| !spec.quality_range.contains(**q))
            {
                return Err(ConfigError::Invalid(format!(
                    "codec '{}' default quality {} is outside range {}",
                    id, q, spec.quality_range
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
