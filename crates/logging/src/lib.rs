//! Logging for Model Depot
//!
//! This crate installs the global `tracing` subscriber: an `EnvFilter`
//! seeded from the configured level (`RUST_LOG` wins when set), human
//! readable or JSON output, and an optional daily rolling log file.

use anyhow::Result;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use config::LoggingConfig;

/// File name prefix of rolled log files
const LOG_FILE_PREFIX: &str = "depot.log";

/// Builds the filter: `RUST_LOG` when present, the configured level otherwise
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.level)?),
    }
}

/// Initializes logging
///
/// Returns the appender guard when logging to a file; keep it alive for the
/// lifetime of the process or buffered lines are lost. Calling this twice is
/// harmless: the second subscriber is simply not installed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let (guard, installed) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer);
            let installed = if config.json {
                builder.json().try_init().is_ok()
            } else {
                builder.try_init().is_ok()
            };
            (Some(guard), installed)
        }
        None => {
            let builder = fmt().with_env_filter(filter).with_target(true);
            let installed = if config.json {
                builder.json().try_init().is_ok()
            } else {
                builder.try_init().is_ok()
            };
            (None, installed)
        }
    };

    if !installed {
        debug!("Global subscriber already installed, keeping it");
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "model_manager=loud".to_string(),
            ..Default::default()
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
