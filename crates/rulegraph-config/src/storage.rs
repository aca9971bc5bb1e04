//! JSON persistence for rules and archived history
//!
//! One file per rule at `<rules_dir>/<rule_id>.json`, wrapped in a
//! versioned [`StorageFile`]. Archived execution records go to
//! `<archive_dir>/<rule_id>-<timestamp>.json`.

use chrono::Utc;
use rulegraph_core::{AutomationRule, ExecutionRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::engine_config::StorageSection;

/// Current storage format version
pub const STORAGE_VERSION: u32 = 1;

const EXTENSION: &str = "json";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid storage key: {key}")]
    InvalidKey { key: String },

    #[error("Version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage file wrapper with version tracking
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "key": "hallway_night",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T) -> Self {
        Self {
            version: STORAGE_VERSION,
            key: key.into(),
            data,
        }
    }
}

/// File-backed rule store
#[derive(Debug, Clone)]
pub struct RuleStorage {
    rules_dir: PathBuf,
    archive_dir: PathBuf,
}

impl RuleStorage {
    pub fn new(rules_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn from_config(config: &StorageSection) -> Self {
        Self::new(&config.rules_dir, &config.archive_dir)
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Path of the file holding `rule_id`
    pub fn rule_path(&self, rule_id: &str) -> StorageResult<PathBuf> {
        check_key(rule_id)?;
        Ok(self.rules_dir.join(format!("{rule_id}.{EXTENSION}")))
    }

    /// Write a rule, replacing any previous version
    pub async fn save(&self, rule: &AutomationRule) -> StorageResult<()> {
        let path = self.rule_path(rule.id.as_str())?;
        let file = StorageFile::new(rule.id.as_str(), rule);
        write_atomic(&self.rules_dir, &path, &file).await?;
        debug!(rule_id = %rule.id, version = rule.version(), "Saved rule");
        Ok(())
    }

    /// Load one rule; `None` if it was never saved
    pub async fn load(&self, rule_id: &str) -> StorageResult<Option<AutomationRule>> {
        let path = self.rule_path(rule_id)?;
        if !path.exists() {
            return Ok(None);
        }
        read_versioned(&path).await.map(Some)
    }

    /// Load every stored rule, sorted by id.
    ///
    /// Unreadable files are logged and skipped so one bad file does not
    /// keep the others from loading.
    pub async fn load_all(&self) -> StorageResult<Vec<AutomationRule>> {
        if !self.rules_dir.exists() {
            return Ok(Vec::new());
        }

        let mut rules = Vec::new();
        let mut entries = fs::read_dir(&self.rules_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match read_versioned::<AutomationRule>(&path).await {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping rule file {:?}: {}", path, e),
            }
        }

        rules.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Loaded {} rules from {:?}", rules.len(), self.rules_dir);
        Ok(rules)
    }

    pub async fn delete(&self, rule_id: &str) -> StorageResult<()> {
        let path = self.rule_path(rule_id)?;
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!(rule_id, "Deleted rule file");
        }
        Ok(())
    }

    /// Write removed execution records to the archive directory
    pub async fn archive_records(
        &self,
        rule_id: &str,
        records: &[ExecutionRecord],
    ) -> StorageResult<PathBuf> {
        check_key(rule_id)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let path = self
            .archive_dir
            .join(format!("{rule_id}-{stamp}.{EXTENSION}"));
        let file = StorageFile::new(rule_id, records);
        write_atomic(&self.archive_dir, &path, &file).await?;
        info!(rule_id, records = records.len(), path = ?path, "Archived history");
        Ok(path)
    }

    /// Read an archive written by [`RuleStorage::archive_records`]
    pub async fn read_archive(&self, path: &Path) -> StorageResult<Vec<ExecutionRecord>> {
        read_versioned(path).await
    }
}

/// Rule ids become file names; keep them to one path component
fn check_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
        })
    }
}

/// Write to a temp file first, then rename over the target
async fn write_atomic<T: Serialize>(
    dir: &Path,
    path: &Path,
    file: &StorageFile<T>,
) -> StorageResult<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).await?;
        debug!("Created storage directory: {:?}", dir);
    }
    let content = serde_json::to_string_pretty(file)?;
    let temp_path = path.with_extension(format!("{EXTENSION}.tmp"));
    fs::write(&temp_path, &content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn read_versioned<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let content = fs::read_to_string(path).await?;
    let file: StorageFile<T> = serde_json::from_str(&content)?;
    if file.version != STORAGE_VERSION {
        return Err(StorageError::VersionMismatch {
            key: file.key,
            expected: STORAGE_VERSION,
            found: file.version,
        });
    }
    Ok(file.data)
}
