//! Configuration management for Model Depot
//!
//! This crate provides the configuration surface consumed by the store, the
//! catalog, the downloader and the runner supervisor. A configuration is
//! built in three layers: built-in defaults, an optional TOML file, and
//! environment overrides.

pub mod environment;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use common::error::{Error, Result};

pub use environment::{apply_env, EnvSource, ProcessEnv};

/// Directory under the user's home holding depot state
pub const DEPOT_HOME_DIR: &str = ".depot";

/// Default remote catalog host
pub const DEFAULT_CATALOG_URL: &str = "https://huggingface.co";

/// Environment variables searched for a catalog token, in order
pub const DEFAULT_TOKEN_ENV_VARS: [&str; 3] = [
    "HUGGINGFACEHUB_API_TOKEN",
    "HUGGING_FACE_HUB_TOKEN",
    "HF_TOKEN",
];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Root directory of the artifact store
    pub storage_root: PathBuf,

    /// Remote catalog settings
    pub catalog: CatalogConfig,

    /// Downloader settings
    pub download: DownloadConfig,

    /// Worker process settings
    pub runner: RunnerConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Remote catalog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL of the metadata API
    pub url: String,

    /// Base URL files are resolved against, the catalog URL when unset
    pub resolve_url: Option<String>,

    /// File holding a stored bearer token
    pub credential_file: Option<PathBuf>,

    /// Environment variables consulted for a token, in order
    pub token_env_vars: Vec<String>,

    /// Tag filter applied to searches
    pub search_filter: Option<String>,

    /// Timeout for metadata requests, in milliseconds
    pub request_timeout_ms: u64,
}

/// Downloader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Connect timeout for file requests, in milliseconds
    pub connect_timeout_ms: u64,

    /// Idle read timeout per file request, in milliseconds
    pub read_timeout_ms: u64,

    /// Keep the staging directory after a resumable failure
    pub retain_partial: bool,
}

/// Worker process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Worker executable
    pub program: PathBuf,

    /// Arguments placed before `--model` and `--port`
    pub args: Vec<String>,

    /// Loopback address the worker binds
    pub host: String,

    /// Delay between health probes, in milliseconds
    pub health_interval_ms: u64,

    /// Deadline for the worker to become healthy, in milliseconds
    pub health_timeout_ms: u64,

    /// Timeout for the load command, in milliseconds
    pub load_timeout_ms: u64,

    /// Grace period between the stop signal and a forced kill, in milliseconds
    pub shutdown_grace_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,

    /// Directory for a daily rolling log file
    pub directory: Option<PathBuf>,
}

/// Returns `~/.depot`, or `./.depot` when no home directory is known
pub fn depot_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEPOT_HOME_DIR))
        .unwrap_or_else(|| PathBuf::from(DEPOT_HOME_DIR))
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            storage_root: depot_home().join("models"),
            catalog: CatalogConfig::default(),
            download: DownloadConfig::default(),
            runner: RunnerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
            resolve_url: None,
            credential_file: Some(depot_home().join("hf_token")),
            token_env_vars: DEFAULT_TOKEN_ENV_VARS.iter().map(|s| s.to_string()).collect(),
            search_filter: Some("mlx".to_string()),
            request_timeout_ms: 30_000,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            read_timeout_ms: 120_000,
            retain_partial: true,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("depot-runner"),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            health_interval_ms: 500,
            health_timeout_ms: 30_000,
            load_timeout_ms: 300_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl DepotConfig {
    /// Loads defaults, then the config file if one exists, then the process environment
    pub fn load() -> Result<Self> {
        Self::load_from(&ProcessEnv)
    }

    /// Same as [`DepotConfig::load`] with an explicit environment
    pub fn load_from(env: &dyn EnvSource) -> Result<Self> {
        let path = env
            .var(environment::CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| depot_home().join("config.toml"));

        let mut config = if path.is_file() {
            Self::from_file(&path)?
        } else {
            debug!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        apply_env(&mut config, env);

        info!("Using artifact store at {:?}", config.storage_root);

        Ok(config)
    }

    /// Parses a TOML file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parses TOML text; missing keys fall back to defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Base URL that file names are resolved against
    pub fn resolve_base(&self) -> &str {
        self.catalog
            .resolve_url
            .as_deref()
            .unwrap_or(&self.catalog.url)
            .trim_end_matches('/')
    }
}

impl CatalogConfig {
    /// Metadata request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DownloadConfig {
    /// Connect timeout for file requests
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle read timeout for file requests
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl RunnerConfig {
    /// Delay between health probes
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// Deadline for the worker to become healthy
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Timeout for the load command
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Grace period before a forced kill
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DepotConfig::from_toml(
            r#"
            storage_root = "/srv/models"

            [runner]
            health_timeout_ms = 2000
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_root, PathBuf::from("/srv/models"));
        assert_eq!(config.runner.health_timeout(), Duration::from_secs(2));
        assert_eq!(config.runner.health_interval(), Duration::from_millis(500));
        assert_eq!(config.catalog.url, DEFAULT_CATALOG_URL);
        assert!(config.download.retain_partial);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = DepotConfig::from_toml("storage_root = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_resolve_base_prefers_override() {
        let mut config = DepotConfig::default();
        assert_eq!(config.resolve_base(), DEFAULT_CATALOG_URL);

        config.catalog.resolve_url = Some("http://mirror.local/".to_string());
        assert_eq!(config.resolve_base(), "http://mirror.local");
    }

    #[test]
    fn test_load_reads_file_named_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.toml");
        std::fs::write(&path, "storage_root = \"/from/file\"\n").unwrap();

        let env: HashMap<String, String> = [(
            environment::CONFIG_PATH.to_string(),
            path.display().to_string(),
        )]
        .into_iter()
        .collect();

        let config = DepotConfig::load_from(&env).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/from/file"));
    }
}
