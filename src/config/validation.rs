//! Configuration validation helpers.
//!
//! Field rules shared by the config file loader and the CLI overrides.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// `${NAME}` or `${NAME:-fallback}`.
static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env reference pattern")
});

/// Parse a humantime timeout or interval such as `750ms`, `5s` or `1m30s`.
///
/// Zero is rejected: every duration in the store configuration bounds or
/// paces an operation.
///
/// # Examples
///
/// ```
/// use hazard_store::config::parse_duration;
///
/// assert_eq!(parse_duration("750ms").unwrap().as_millis(), 750);
/// assert_eq!(parse_duration("1m30s").unwrap().as_secs(), 90);
/// assert!(parse_duration("0s").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration is empty".to_string());
    }
    let duration = humantime::parse_duration(s).map_err(|e| format!("'{s}': {e}"))?;
    if duration.is_zero() {
        return Err(format!("'{s}': duration must be non-zero"));
    }
    Ok(duration)
}

/// Reject a zero duration for the named field.
pub fn require_non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{field} must be non-zero"
        )));
    }
    Ok(())
}

/// Whether `project` can name a database file: ASCII letters, digits, `-`, `_`.
pub fn is_valid_project(project: &str) -> bool {
    !project.is_empty()
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Substitute `${NAME}` and `${NAME:-fallback}` references from the environment.
///
/// An unset variable without a fallback becomes empty and is logged, so a
/// missing `HAZARD_STORE_PROJECT` shows up before the first connect fails.
pub fn expand_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            match (std::env::var(name), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(fallback)) => fallback.as_str().to_string(),
                (Err(_), None) => {
                    tracing::warn!(variable = name, "Config references an unset variable");
                    String::new()
                }
            }
        })
        .into_owned()
}
