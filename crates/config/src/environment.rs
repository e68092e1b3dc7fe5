//! Environment overrides
//!
//! Environment variables take precedence over the config file. Lookups go
//! through [`EnvSource`] so tests can supply a fixed environment instead of
//! mutating the process one.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::DepotConfig;

/// Path of the TOML config file
pub const CONFIG_PATH: &str = "DEPOT_CONFIG";

/// Storage root override, also propagated to spawned workers
pub const STORAGE_ROOT: &str = "DEPOT_MODELS";

/// Metadata API base URL override
pub const CATALOG_URL: &str = "DEPOT_CATALOG_URL";

/// File resolution base URL override
pub const BASE_URL: &str = "DEPOT_BASE_URL";

/// Stored credential file override
pub const CREDENTIALS: &str = "DEPOT_CREDENTIALS";

/// Worker executable override
pub const RUNNER_PROGRAM: &str = "DEPOT_RUNNER";

/// Log level override
pub const LOG_LEVEL: &str = "DEPOT_LOG";

/// JSON log output toggle
pub const LOG_JSON: &str = "DEPOT_LOG_JSON";

/// Source of environment variables
pub trait EnvSource {
    /// Returns the trimmed, non-empty value of `key`
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().and_then(non_empty)
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned().and_then(non_empty)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Applies every recognised override found in `env`
pub fn apply_env(config: &mut DepotConfig, env: &dyn EnvSource) {
    if let Some(root) = env.var(STORAGE_ROOT) {
        debug!("{} overrides storage root", STORAGE_ROOT);
        config.storage_root = PathBuf::from(root);
    }

    if let Some(url) = env.var(CATALOG_URL) {
        config.catalog.url = url;
    }

    if let Some(url) = env.var(BASE_URL) {
        debug!("{} overrides file resolution base", BASE_URL);
        config.catalog.resolve_url = Some(url);
    }

    if let Some(path) = env.var(CREDENTIALS) {
        config.catalog.credential_file = Some(PathBuf::from(path));
    }

    if let Some(program) = env.var(RUNNER_PROGRAM) {
        config.runner.program = PathBuf::from(program);
    }

    if let Some(level) = env.var(LOG_LEVEL) {
        config.logging.level = level;
    }

    if let Some(json) = env.var(LOG_JSON) {
        config.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}
