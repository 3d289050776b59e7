//! Logging setup for the harness, built on the `tracing` ecosystem.
//!
//! Harness lifecycle events go to the default targets; diagnostic records
//! received from the validation layer are emitted under the `vulkan` target so
//! they can be filtered separately, e.g. `RUST_LOG=info,vulkan=debug`.

use std::io::IsTerminal;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LoggingConfig, PASSTHROUGH_ENV_VARS};
use crate::error::{ConfigError, HarnessError};

/// Initializes a minimal logging setup, directing messages to `stderr`.
///
/// Intended for tests and early startup. Filters with `RUST_LOG`, defaulting
/// to `info`. Errors (a global subscriber already being set) are ignored.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Re-initialization is
/// not an error: the first subscriber stays in place.
pub fn init_logging(config: &LoggingConfig) -> Result<(), HarnessError> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        invalid => {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level in config: {invalid}"
            ))
            .into())
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let result = match config.format.to_lowercase().as_str() {
        "json" => fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .try_init(),
        _ => fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("Global subscriber already installed: {}", e);
    }
    Ok(())
}

/// Logs the loader-related environment so a run can be reproduced.
pub fn log_loader_environment() {
    for name in PASSTHROUGH_ENV_VARS {
        match std::env::var(name) {
            Ok(value) => tracing::info!("{} = {}", name, value),
            Err(_) => tracing::debug!("{} is not set", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level() {
        let config = LoggingConfig {
            level: "verbose".into(),
            format: "text".into(),
        };
        assert!(matches!(
            init_logging(&config),
            Err(HarnessError::Config(ConfigError::ValidationError(_)))
        ));
    }

    #[test]
    fn repeated_initialization_is_harmless() {
        init_minimal_logging();
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
        log_loader_environment();
    }
}
