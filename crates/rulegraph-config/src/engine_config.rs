//! Engine configuration
//!
//! Loaded from a single YAML file. Every field has a default, so an empty
//! (or missing) file yields a working configuration. A few settings can be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `RULEGRAPH_BIND` | `api.bind` |
//! | `RULEGRAPH_RULES_DIR` | `storage.rules_dir` |
//! | `RULEGRAPH_LOG` | `logging.filter` |

use chrono::FixedOffset;
use rulegraph_automation::parse_offset;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};

pub const ENV_BIND: &str = "RULEGRAPH_BIND";
pub const ENV_RULES_DIR: &str = "RULEGRAPH_RULES_DIR";
pub const ENV_LOG: &str = "RULEGRAPH_LOG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub history: HistorySection,
    pub storage: StorageSection,
    pub api: ApiSection,
    pub notifications: NotificationsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Used when a rule sets no deadline of its own
    pub run_deadline_seconds: u64,
    pub retry: RetrySection,
    /// Fixed UTC offset, e.g. `"+01:00"`
    pub time_zone: String,
    /// Capacity of the dispatcher to engine channel
    pub run_queue_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            run_deadline_seconds: 3600,
            retry: RetrySection::default(),
            time_zone: "+00:00".to_string(),
            run_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    #[default]
    Exponential,
}

/// Backoff between node retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub strategy: RetryStrategy,
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_ms: 200,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySection {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Oldest records are evicted past this
    pub max_records_per_rule: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_records_per_rule: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub rules_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from("rules"),
            archive_dir: PathBuf::from("archive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub bind: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsSection {
    /// Where failures of critical-priority rules are reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_failures: Option<NotificationTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub channel: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `tracing_subscriber::EnvFilter` directive
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!("Loading engine config: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_yaml_str(&content, path)?
            .with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Like [`EngineConfig::load`], but a missing file yields defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!("No config at {:?}, using defaults", path);
        let config = Self::default().with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without touching the environment
    pub fn from_yaml_str(content: &str, source_path: &Path) -> ConfigResult<Self> {
        // An empty document parses as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(bind) = lookup(ENV_BIND) {
            self.api.bind = bind;
        }
        if let Some(dir) = lookup(ENV_RULES_DIR) {
            self.storage.rules_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.logging.filter = filter;
        }
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.bind_addr()?;
        self.time_zone()?;

        let retry = &self.engine.retry;
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "engine.retry.multiplier",
                format!("must be at least 1.0, got {}", retry.multiplier),
            ));
        }
        if retry.max_ms < retry.base_ms {
            return Err(ConfigError::invalid(
                "engine.retry.max_ms",
                "must not be smaller than base_ms",
            ));
        }
        if self.engine.run_deadline_seconds == 0 {
            return Err(ConfigError::invalid(
                "engine.run_deadline_seconds",
                "must be positive",
            ));
        }
        if self.engine.run_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "engine.run_queue_capacity",
                "must be positive",
            ));
        }
        if self.history.max_records_per_rule == 0 {
            return Err(ConfigError::invalid(
                "history.max_records_per_rule",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> ConfigResult<SocketAddr> {
        self.api
            .bind
            .parse()
            .map_err(|e| ConfigError::invalid("api.bind", format!("{}: {e}", self.api.bind)))
    }

    pub fn time_zone(&self) -> ConfigResult<FixedOffset> {
        parse_offset(&self.engine.time_zone)
            .map_err(|e| ConfigError::invalid("engine.time_zone", e.to_string()))
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.engine.run_deadline_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_default() {
        let config = EngineConfig::from_yaml_str("", Path::new("engine.yaml")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.retry.base(), Duration::from_millis(200));
        assert_eq!(config.run_deadline(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
engine:
  time_zone: "+02:00"
  retry:
    strategy: fixed
    base_ms: 500
history:
  max_records_per_rule: 10
notifications:
  critical_failures:
    channel: sms
    recipients: [oncall]
"#;
        let config = EngineConfig::from_yaml_str(yaml, Path::new("engine.yaml")).unwrap();
        assert_eq!(config.engine.retry.strategy, RetryStrategy::Fixed);
        assert_eq!(config.engine.retry.base_ms, 500);
        assert_eq!(config.engine.retry.max_ms, 30_000);
        assert_eq!(config.engine.run_deadline_seconds, 3600);
        assert_eq!(config.history.max_records_per_rule, 10);
        assert_eq!(config.time_zone().unwrap().local_minus_utc(), 7200);
        let target = config.notifications.critical_failures.unwrap();
        assert_eq!(target.channel, "sms");
        assert_eq!(target.recipients, vec!["oncall"]);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BIND, "0.0.0.0:9000"),
            (ENV_RULES_DIR, "/var/lib/rules"),
            (ENV_LOG, "debug"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr().unwrap().port(), 9000);
        assert_eq!(config.storage.rules_dir, PathBuf::from("/var/lib/rules"));
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn test_invalid_values() {
        let mut config = EngineConfig::default();
        config.api.bind = "not an address".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "api.bind"
        ));

        let mut config = EngineConfig::default();
        config.engine.time_zone = "Europe/Paris".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "engine.time_zone"
        ));

        let mut config = EngineConfig::default();
        config.engine.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_carries_path() {
        let err = EngineConfig::from_yaml_str("engine: [1, 2", Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ParseYaml { ref path, .. } if path == Path::new("bad.yaml")
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "api:\n  bind: 127.0.0.1:7000\n").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let config = EngineConfig::from_yaml_str(&content, &path).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 7000);

        let missing = EngineConfig::load(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
    }
}
