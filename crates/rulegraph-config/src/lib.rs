//! Engine configuration and rule persistence
//!
//! - [`EngineConfig`]: YAML settings with defaults and environment overrides
//! - [`RuleStorage`]: one versioned JSON file per rule, plus history archives

mod engine_config;
mod error;
mod storage;

pub use engine_config::{
    ApiSection, EngineConfig, EngineSection, HistorySection, LoggingSection, NotificationTarget,
    NotificationsSection, RetrySection, RetryStrategy, StorageSection, ENV_BIND, ENV_LOG,
    ENV_RULES_DIR,
};
pub use error::{ConfigError, ConfigResult};
pub use storage::{RuleStorage, StorageError, StorageFile, StorageResult, STORAGE_VERSION};
