use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable console logging
    pub console_enabled: bool,
    /// Enable file logging
    pub file_enabled: bool,
    /// Log file directory
    pub log_dir: PathBuf,
    /// Log file name prefix
    pub file_prefix: String,
    /// Log rotation (daily, hourly, never)
    pub rotation: String,
    /// Enable structured JSON logging for the file output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            console_enabled: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            file_prefix: "ssm-toolkit".to_string(),
            rotation: "daily".to_string(),
            json_format: false,
        }
    }
}

/// Initialize the logging system.
///
/// Returns the appender guard when file logging is enabled; the caller must
/// keep it alive for the lifetime of the process or buffered log lines are
/// lost on exit.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let mut layers = Vec::new();
    let mut guard = None;

    // Console layer writes to stderr so subcommand output stays clean on stdout.
    if config.console_enabled {
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose)
            .with_filter(env_filter.clone());

        layers.push(console_layer.boxed());
    }

    // File layer
    if config.file_enabled {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("could not create log directory {:?}", config.log_dir))?;

        let file_appender = match config.rotation.as_str() {
            "daily" => rolling::daily(&config.log_dir, &config.file_prefix),
            "hourly" => rolling::hourly(&config.log_dir, &config.file_prefix),
            _ => rolling::never(&config.log_dir, format!("{}.log", config.file_prefix)),
        };

        let (writer, worker_guard) = non_blocking(file_appender);
        guard = Some(worker_guard);

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(env_filter.clone())
                .boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter.clone())
                .boxed()
        };

        layers.push(file_layer);
    }

    tracing_subscriber::registry().with(layers).init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_logs_warnings_to_console_only() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "warn");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: LoggingConfig = toml::from_str("level = \"debug\"").unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_prefix, "ssm-toolkit");
    }
}
