//! Configuration loaded from `~/.bookkeeper/config.json`.
//!
//! Every field has a default, so a missing file is the same as `{}`. Set
//! `BOOKKEEPER_CONFIG` to read a different file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::{DbError, LedgerDb};
use crate::dispatch::{
    HandlerRegistry, InlineAggregator, LocalDispatcher, QueuedDispatcher, SqliteTaskQueue,
};
use crate::error::LedgerError;

pub const CONFIG_ENV: &str = "BOOKKEEPER_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// SQLite file. Defaults to `~/.bookkeeper/ledger.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// env_logger filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: default_log_level(),
            dispatch: DispatchConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where envelope payloads go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Aggregate inside the posting transaction.
    #[default]
    Inline,
    /// POST to `aggregatorUrl` after commit.
    Local,
    /// Queue an outbox task for the dispatch worker.
    Queued,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    /// Aggregator endpoint for `local` and `queued` modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_url: Option<String>,
    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

/// Resolve the config file path: `$BOOKKEEPER_CONFIG`, else `~/.bookkeeper/config.json`.
pub fn config_path() -> Result<PathBuf, LedgerError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(LedgerError::Open(DbError::HomeDirNotFound))?;
    Ok(home.join(".bookkeeper").join("config.json"))
}

/// Load the config, falling back to defaults when the file does not exist.
pub fn load_config() -> Result<LedgerConfig, LedgerError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<LedgerConfig, LedgerError> {
    if !path.exists() {
        log::info!("Config: {} not found, using defaults", path.display());
        return Ok(LedgerConfig::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| LedgerError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| LedgerError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

impl LedgerConfig {
    pub fn database_path(&self) -> Result<PathBuf, LedgerError> {
        match &self.database_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(LedgerDb::default_path()?),
        }
    }

    /// Build the dispatch handlers for the configured mode.
    pub fn handler_registry(&self) -> Result<Arc<HandlerRegistry>, LedgerError> {
        let dispatch = &self.dispatch;
        let builder = HandlerRegistry::builder();
        let builder = match dispatch.mode {
            DispatchMode::Inline => builder.register(Arc::new(InlineAggregator)),
            DispatchMode::Local => {
                let dispatcher = LocalDispatcher::new(self.aggregator_url()?)?
                    .with_headers(dispatch.headers.clone());
                builder.register(Arc::new(dispatcher))
            }
            DispatchMode::Queued => {
                let dispatcher = QueuedDispatcher::new(self.aggregator_url()?, Arc::new(SqliteTaskQueue))
                    .with_headers(dispatch.headers.clone());
                builder.register(Arc::new(dispatcher))
            }
        };
        Ok(builder.build())
    }

    fn aggregator_url(&self) -> Result<&str, LedgerError> {
        self.dispatch
            .aggregator_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                LedgerError::Config(format!(
                    "dispatch.aggregatorUrl is required for {:?} mode",
                    self.dispatch.mode
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: LedgerConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.dispatch.mode, DispatchMode::Inline);
        assert_eq!(config.dispatch.queue, QueueConfig::default());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let json = r#"{
            "databasePath": "/tmp/ledger.db",
            "logLevel": "debug",
            "dispatch": {
                "mode": "queued",
                "aggregatorUrl": "http://localhost:8080/aggregate",
                "headers": {"x-service": "ledger"},
                "queue": {"pollIntervalSecs": 2, "maxAttempts": 3}
            }
        }"#;
        let config: LedgerConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.database_path().expect("path"), PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.dispatch.mode, DispatchMode::Queued);
        assert_eq!(config.dispatch.queue.poll_interval_secs, 2);
        assert_eq!(config.dispatch.queue.max_attempts, 3);
        assert_eq!(config.dispatch.queue.batch_size, 50);

        let registry = config.handler_registry().expect("registry");
        assert_eq!(registry.names(), vec!["queued"]);
        assert_eq!(registry.before_commit().count(), 1);
    }

    #[test]
    fn test_remote_modes_require_url() {
        let mut config = LedgerConfig::default();
        config.dispatch.mode = DispatchMode::Local;
        assert!(matches!(config.handler_registry(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_inline_registry() {
        let registry = LedgerConfig::default().handler_registry().expect("registry");
        assert_eq!(registry.names(), vec!["inline"]);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("config.json")).expect("load");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(load_config_from(&path), Err(LedgerError::Config(_))));
    }
}
