//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::db::StoreTarget;
use crate::storage::{StoreError, WriteMode};

use super::validation::{ConfigError, expand_env_vars, is_valid_project, require_non_zero};

// =============================================================================
// Constants
// =============================================================================

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

/// Default data directory for database files.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// Default bound on client construction and release.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single save or lookup.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default WAL checkpoint interval.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Default save attempts per ingested event.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first retry delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Default retry delay cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

// =============================================================================
// Store Configuration
// =============================================================================

/// Backing store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store target identifier; names the database file. Required to connect.
    pub project: Option<String>,

    /// Connection URL override for a local emulator or scratch database.
    pub emulator_url: Option<String>,

    /// Directory holding `<project>.db` (default: "data").
    pub data_dir: String,

    /// Maximum pooled connections (default: 4).
    pub pool_size: u32,

    /// Bound on client construction and release (default: 10s).
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Bound on a single save, lookup or row fetch (default: 5s).
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// WAL checkpoint interval of the client's background task (default: 30s).
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,

    /// Same-id concurrent write policy (default: last_writer_wins).
    pub write_mode: WriteMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            project: None,
            emulator_url: None,
            data_dir: DEFAULT_DATA_DIR.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            write_mode: WriteMode::default(),
        }
    }
}

impl StoreConfig {
    /// Configured project, with blank values treated as absent.
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }

    fn emulator_url(&self) -> Option<&str> {
        self.emulator_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    /// Resolve connection parameters.
    ///
    /// # Errors
    /// Returns `StoreError::Configuration` if the project is missing or invalid.
    pub fn target(&self) -> Result<StoreTarget, StoreError> {
        let project = self.project().ok_or_else(|| {
            StoreError::Configuration(
                "store.project is not set (config file, --project or HAZARD_STORE_PROJECT)"
                    .to_string(),
            )
        })?;
        if !is_valid_project(project) {
            return Err(StoreError::Configuration(format!(
                "invalid store.project '{project}': use ASCII letters, digits, '-' or '_'"
            )));
        }

        let (url, data_dir) = match self.emulator_url() {
            Some(url) => (url.to_string(), None),
            None => {
                let dir = PathBuf::from(&self.data_dir);
                let file = dir.join(format!("{project}.db"));
                (format!("sqlite:{}?mode=rwc", file.display()), Some(dir))
            }
        };

        Ok(StoreTarget {
            project: project.to_string(),
            url,
            data_dir,
            pool_size: self.pool_size,
            connect_timeout: self.connect_timeout,
            checkpoint_interval: self.checkpoint_interval,
        })
    }
}

// =============================================================================
// Ingest Configuration
// =============================================================================

/// Retry policy for the ingestion loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Save attempts per event, including the first (default: 3).
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt (default: 200ms).
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on the retry delay (default: 5s).
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Backing store configuration.
    pub store: StoreConfig,

    /// Ingestion retry policy.
    pub ingest: IngestConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` references.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse and validate YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let store = &self.store;

        if let Some(project) = store.project()
            && !is_valid_project(project)
        {
            return Err(ConfigError::ValidationError(format!(
                "invalid store project: '{project}'"
            )));
        }

        if store.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "store pool_size must be positive".to_string(),
            ));
        }

        require_non_zero("store connect_timeout", store.connect_timeout)?;
        require_non_zero("store operation_timeout", store.operation_timeout)?;
        require_non_zero("store checkpoint_interval", store.checkpoint_interval)?;

        let ingest = &self.ingest;
        if ingest.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "ingest max_attempts must be positive".to_string(),
            ));
        }
        require_non_zero("ingest initial_backoff", ingest.initial_backoff)?;
        if ingest.initial_backoff > ingest.max_backoff {
            return Err(ConfigError::ValidationError(format!(
                "ingest initial_backoff ({:?}) exceeds max_backoff ({:?})",
                ingest.initial_backoff, ingest.max_backoff
            )));
        }

        Ok(())
    }
}
