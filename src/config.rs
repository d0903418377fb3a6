use crate::command::PollPolicy;
use crate::error::Result;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Main configuration for the toolkit, loaded from an optional file under
/// the user's config directory. Every field has a default so the file is
/// never required.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolkitConfig {
    /// Default AWS profile and region, overridden by CLI flags
    pub aws: AwsDefaults,

    /// Remote command polling policy
    pub command: CommandConfig,

    /// Instance listing cache
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AwsDefaults {
    /// Default AWS profile (CLI --profile wins)
    pub default_profile: Option<String>,

    /// Default AWS region (CLI --region wins)
    pub default_region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Interval between command status polls in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum time to wait for a command to finish in seconds
    pub poll_timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_timeout_secs: 300,
        }
    }
}

impl CommandConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_wait: Duration::from_secs(self.poll_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Write the instance listing to a cache file after `list`
    pub enabled: bool,

    /// Cache file path (defaults to ~/.ssm_inventory_cache)
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl ToolkitConfig {
    pub fn default_path() -> Option<PathBuf> {
        // Prefer ~/.config on Unix-like platforms for consistency with
        // common CLI tool conventions.
        let base_dir = if cfg!(windows) {
            dirs::config_dir()?
        } else {
            dirs::home_dir()
                .map(|h| h.join(".config"))
                .or_else(dirs::config_dir)?
        };

        Some(base_dir.join("ssm-toolkit").join("config.toml"))
    }

    /// Load configuration from the given path, or the default location.
    /// A missing file yields the built-in defaults.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            debug!("no config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).await?;

        let parsed: ToolkitConfig = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        debug!("loaded config from {:?}", path);
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.toml");

        let config = ToolkitConfig::load(Some(path.to_string_lossy().as_ref()))
            .await
            .unwrap();
        assert_eq!(config.command.poll_interval_ms, 1_000);
        assert_eq!(config.command.poll_timeout_secs, 300);
        assert!(config.cache.enabled);
    }

    #[tokio::test]
    async fn loads_toml_overrides() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let toml = r#"
[aws]
default_profile = "sandbox"
default_region = "eu-west-1"

[command]
poll_timeout_secs = 60

[cache]
enabled = false
"#;
        fs::write(&path, toml).await.unwrap();

        let config = ToolkitConfig::load(Some(path.to_string_lossy().as_ref()))
            .await
            .unwrap();
        assert_eq!(config.aws.default_profile.as_deref(), Some("sandbox"));
        assert_eq!(config.aws.default_region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.command.poll_timeout_secs, 60);
        // Unset fields keep their defaults.
        assert_eq!(config.command.poll_interval_ms, 1_000);
        assert!(!config.cache.enabled);
    }

    #[tokio::test]
    async fn loads_json_by_extension() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let json = r#"{"command": {"poll_interval_ms": 250}}"#;
        fs::write(&path, json).await.unwrap();

        let config = ToolkitConfig::load(Some(path.to_string_lossy().as_ref()))
            .await
            .unwrap();
        assert_eq!(config.command.poll_interval_ms, 250);
    }

    #[test]
    fn poll_policy_converts_units() {
        let command = CommandConfig {
            poll_interval_ms: 500,
            poll_timeout_secs: 10,
        };
        let policy = command.poll_policy();
        assert_eq!(policy.interval, Duration::from_millis(500));
        assert_eq!(policy.max_wait, Duration::from_secs(10));
    }
}
