//! Configuration management
//!
//! This module handles loading, validation, and management of the Slape configuration.
//! Configuration is stored in TOML format at ~/.slape/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **server**: HTTP bind address
//! - **workers**: Worker host, port range, image, models directory, GPU
//! - **readiness**: Health probe interval and deadline
//! - **pipelines**: Debate round count
//! - **timeouts**: Per-call deadlines for setup, generate and shutdown
//! - **registry**: Worker registry database and startup reconciliation
//!
//! Every section may be omitted; missing values fall back to defaults.
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Creates the data directory if it doesn't exist
//! - Creates and canonicalizes the models directory, which is bind-mounted into workers
//!
//! # Examples
//!
//! ```no_run
//! use slape_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Listening on {}", config.server.bind);
//! println!("Worker image: {}", config.workers.image_ref());
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Core service settings
    #[serde(default)]
    pub core: CoreConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker container settings
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Readiness gate settings
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Pipeline strategy settings
    #[serde(default)]
    pub pipelines: PipelinesConfig,

    /// Request deadlines
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Worker registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Core service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Worker image variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageVariant {
    #[default]
    Cpu,
    Cuda,
    Rocm,
}

impl ImageVariant {
    /// llama.cpp server image for this variant
    pub fn image(&self) -> &'static str {
        match self {
            ImageVariant::Cpu => "ghcr.io/ggml-org/llama.cpp:server",
            ImageVariant::Cuda => "ghcr.io/ggml-org/llama.cpp:server-cuda",
            ImageVariant::Rocm => "ghcr.io/ggml-org/llama.cpp:server-rocm",
        }
    }
}

/// Worker container configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Host the worker ports are published on
    #[serde(default = "default_worker_host")]
    pub host: String,

    /// Port of worker 0; worker i listens on `base_port + i`
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Largest number of models a single setup request may ask for
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Directory holding model files (supports ~ expansion)
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Image variant used when `image` is not set
    #[serde(default)]
    pub image_variant: ImageVariant,

    /// Explicit image reference, wins over `image_variant`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Request GPU devices for workers
    #[serde(default)]
    pub gpu: bool,

    /// Context length passed to the inference server
    #[serde(default = "default_context_length")]
    pub context_length: u32,

    /// Grace period before a stopped worker is killed (seconds)
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

/// Readiness gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessConfig {
    /// Delay between health probes (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// How long a worker may take to become ready (seconds)
    #[serde(default = "default_readiness_timeout_secs")]
    pub timeout_secs: u64,

    /// Timeout of a single health probe (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Pipeline strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelinesConfig {
    /// Number of debate rounds
    #[serde(default = "default_debate_rounds")]
    pub debate_rounds: usize,
}

/// Request deadline configuration (seconds)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_setup_secs")]
    pub setup_secs: u64,

    #[serde(default = "default_generate_secs")]
    pub generate_secs: u64,

    /// Bound on one completion call; a generate call makes many
    #[serde(default = "default_completion_secs")]
    pub completion_secs: u64,

    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

/// Worker registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Record workers in SQLite so they can be reclaimed after a crash
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Registry database path (supports ~ expansion)
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// Run the orphan recovery pass when the service starts
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,

    /// Remove orphans found during reconciliation (otherwise only report them)
    #[serde(default = "default_true")]
    pub remove_orphans: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.slape")
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_worker_host() -> String {
    "localhost".to_string()
}

fn default_base_port() -> u16 {
    8000
}

fn default_max_workers() -> usize {
    8
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_context_length() -> u32 {
    16348
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_readiness_timeout_secs() -> u64 {
    300
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_debate_rounds() -> usize {
    3
}

fn default_setup_secs() -> u64 {
    600
}

fn default_generate_secs() -> u64 {
    600
}

fn default_completion_secs() -> u64 {
    300
}

fn default_shutdown_secs() -> u64 {
    30
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("~/.slape/registry.db")
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            host: default_worker_host(),
            base_port: default_base_port(),
            max_workers: default_max_workers(),
            models_dir: default_models_dir(),
            image_variant: ImageVariant::default(),
            image: None,
            gpu: false,
            context_length: default_context_length(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl WorkersConfig {
    /// Image reference handed to the container runtime
    pub fn image_ref(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| self.image_variant.image().to_string())
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_secs: default_readiness_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            debate_rounds: default_debate_rounds(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            setup_secs: default_setup_secs(),
            generate_secs: default_generate_secs(),
            completion_secs: default_completion_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn setup(&self) -> Duration {
        Duration::from_secs(self.setup_secs)
    }

    pub fn generate(&self) -> Duration {
        Duration::from_secs(self.generate_secs)
    }

    pub fn completion(&self) -> Duration {
        Duration::from_secs(self.completion_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_registry_path(),
            reconcile_on_startup: true,
            remove_orphans: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.slape/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // The file keeps the unexpanded defaults so it stays portable
        let toml_string = Self::default().to_toml()?;

        let mut config = Self::default();
        config.validate_and_process()?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.slape/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".slape").join("config.toml"))
    }

    /// Check value ranges without touching the filesystem
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.workers.base_port == 0 {
            return Err(EngineError::Config("base_port must be > 0".to_string()));
        }

        if self.workers.max_workers == 0 {
            return Err(EngineError::Config("max_workers must be >= 1".to_string()));
        }

        let last_port = u32::from(self.workers.base_port) + self.workers.max_workers as u32 - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(EngineError::Config(format!(
                "base_port {} leaves no room for {} workers",
                self.workers.base_port, self.workers.max_workers
            )));
        }

        if self.readiness.interval_ms == 0 {
            return Err(EngineError::Config("interval_ms must be > 0".to_string()));
        }

        if self.readiness.timeout_secs == 0 || self.readiness.probe_timeout_ms == 0 {
            return Err(EngineError::Config(
                "readiness timeouts must be > 0".to_string(),
            ));
        }

        if self.readiness.interval() > self.readiness.timeout() {
            return Err(EngineError::Config(
                "interval_ms must not exceed the readiness timeout".to_string(),
            ));
        }

        if self.pipelines.debate_rounds == 0 {
            return Err(EngineError::Config("debate_rounds must be >= 1".to_string()));
        }

        if self.timeouts.setup_secs == 0
            || self.timeouts.generate_secs == 0
            || self.timeouts.completion_secs == 0
            || self.timeouts.shutdown_secs == 0
        {
            return Err(EngineError::Config("timeouts must be > 0".to_string()));
        }

        if self.timeouts.completion_secs > self.timeouts.generate_secs {
            return Err(EngineError::Config(
                "completion_secs must not exceed generate_secs".to_string(),
            ));
        }

        if let Some(image) = &self.workers.image {
            if image.trim().is_empty() {
                return Err(EngineError::Config("image must not be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates value ranges
    /// - Expands ~ in paths
    /// - Creates the data directory
    /// - Creates and canonicalizes the models directory
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        self.validate()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        self.registry.path = expand_path(&self.registry.path)?;

        self.workers.models_dir = expand_path(&self.workers.models_dir)?;
        self.workers.models_dir = canonicalize_or_create(&self.workers.models_dir)?;

        if !self.workers.models_dir.is_dir() {
            return Err(EngineError::Config(format!(
                "Models path is not a directory: {:?}",
                self.workers.models_dir
            )));
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Canonicalize path, creating it if it doesn't exist
fn canonicalize_or_create(path: &Path) -> Result<PathBuf, EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }

    path.canonicalize()
        .map_err(|e| EngineError::Config(format!("Invalid path {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> String {
        format!(
            r#"
[core]
data_dir = "{data}"

[workers]
models_dir = "{models}"

[registry]
path = "{data}/registry.db"
"#,
            data = dir.path().join("data").display(),
            models = dir.path().join("models").display(),
        )
    }

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.workers.base_port, 8000);
        assert_eq!(config.workers.context_length, 16348);
        assert_eq!(config.readiness.interval(), Duration::from_secs(1));
        assert_eq!(config.pipelines.debate_rounds, 3);
        assert!(config.registry.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_image_override_wins() {
        let mut workers = WorkersConfig::default();
        assert_eq!(workers.image_ref(), "ghcr.io/ggml-org/llama.cpp:server");

        workers.image_variant = ImageVariant::Cuda;
        assert_eq!(workers.image_ref(), "ghcr.io/ggml-org/llama.cpp:server-cuda");

        workers.image = Some("local/llama:dev".to_string());
        assert_eq!(workers.image_ref(), "local/llama:dev");
    }

    #[test]
    fn test_minimal_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_toml(&config_in(&dir)).unwrap();

        assert_eq!(config.workers.base_port, 8000);
        assert_eq!(config.timeouts.generate(), Duration::from_secs(600));
        assert!(config.core.data_dir.is_dir());
        assert!(config.workers.models_dir.is_dir());
        assert!(config.workers.models_dir.is_absolute());
    }

    #[test]
    fn test_rejects_bad_log_level() {
        let mut config = Config::default();
        config.core.log_level = "loud".to_string();

        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_port_overflow() {
        let mut config = Config::default();
        config.workers.base_port = 65530;
        config.workers.max_workers = 8;

        assert!(config.validate().is_err());

        config.workers.max_workers = 6;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_interval_longer_than_timeout() {
        let mut config = Config::default();
        config.readiness.interval_ms = 10_000;
        config.readiness.timeout_secs = 5;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_rounds() {
        let mut config = Config::default();
        config.pipelines.debate_rounds = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = config.to_toml().unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config, deserialized);
    }
}
