//! Configuration module for the hazard store.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Store settings (project, emulator URL, pool size, timeouts, write mode)
//! - Ingestion retry policy

mod app;
mod validation;

pub use app::{
    AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_CONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT,
    IngestConfig, StoreConfig,
};
pub use validation::{
    ConfigError, expand_env_vars, is_valid_project, parse_duration, require_non_zero,
};
