//! Core data types for the storage layer.
//!
//! - [`Event`]: a hazard/alert record keyed by its upstream identifier
//! - [`Area`]: an affected area, matched by `code`
//! - [`EventFilter`]: filter, limit and ordering inputs for listings
//! - [`SaveOutcome`]: result of a deduplicated write
//! - [`WriteMode`] / [`ClientState`]: write policy and client lifecycle states

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::StoreError;

/// Maximum number of records a single listing may return.
pub const MAX_LIMIT: u32 = 10_000;

/// An event record persisted in the `events` table.
///
/// The header (`id`, `areas`, `updated_at`) is interpreted by the store; every
/// other field of the upstream document is carried opaquely in `payload`.
///
/// # Example
///
/// ```
/// use hazard_store::{Area, Event};
/// use chrono::Utc;
///
/// let event = Event::new("jma-2024-0001", Utc::now())
///     .with_area(Area::new("13101"))
///     .with_field("headline", "Heavy rain warning");
/// assert!(event.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier assigned by the upstream source.
    pub id: String,
    /// Affected areas.
    #[serde(default)]
    pub areas: Vec<Area>,
    /// Supersession key.
    pub updated_at: DateTime<Utc>,
    /// Remaining domain fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Create an event with no areas and an empty payload.
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            areas: Vec::new(),
            updated_at,
            payload: Map::new(),
        }
    }

    /// Add an affected area.
    pub fn with_area(mut self, area: Area) -> Self {
        self.areas.push(area);
        self
    }

    /// Add a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Distinct area codes, sorted.
    pub fn area_codes(&self) -> BTreeSet<&str> {
        self.areas.iter().map(|a| a.code.as_str()).collect()
    }

    /// Check the header fields the store relies on.
    ///
    /// # Errors
    /// Returns `StoreError::Validation` for a blank id, an id with control
    /// characters, or a blank area code.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.trim().is_empty() {
            return Err(StoreError::Validation("event id is empty".to_string()));
        }
        if self.id.chars().any(char::is_control) {
            return Err(StoreError::Validation(format!(
                "event id contains control characters: {:?}",
                self.id
            )));
        }
        if let Some(pos) = self.areas.iter().position(|a| a.code.trim().is_empty()) {
            return Err(StoreError::Validation(format!(
                "event '{}' has an empty area code at index {}",
                self.id, pos
            )));
        }
        Ok(())
    }
}

/// An affected area. Only `code` is interpreted; other fields are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub code: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Area {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Listing filter.
///
/// Predicates are combined with AND. Results are always ordered by
/// `updated_at` descending, ties broken by `id` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Inclusive lower bound on `updated_at`.
    pub updated_after: Option<DateTime<Utc>>,
    /// Match records whose area set intersects this set.
    pub area_codes: Option<BTreeSet<String>>,
    /// Maximum records returned (clamped to [`MAX_LIMIT`]).
    pub limit: u32,
}

impl EventFilter {
    pub fn new(limit: u32) -> Self {
        Self {
            updated_after: None,
            area_codes: None,
            limit,
        }
    }

    pub fn updated_after(mut self, ts: DateTime<Utc>) -> Self {
        self.updated_after = Some(ts);
        self
    }

    pub fn area_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.area_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    /// Limit after clamping.
    pub fn effective_limit(&self) -> u32 {
        self.limit.min(MAX_LIMIT)
    }

    /// Whether the filter can never match anything.
    pub fn is_empty(&self) -> bool {
        self.limit == 0 || self.area_codes.as_ref().is_some_and(BTreeSet::is_empty)
    }
}

/// Result of [`EventRepository::save`](crate::EventRepository::save).
#[derive(Debug)]
pub enum SaveOutcome {
    /// The event superseded the stored record (or there was none).
    Written,
    /// The stored record is at least as recent; nothing was written.
    Skipped,
    /// Precondition write lost a race with a concurrent writer.
    Conflict,
    /// The save failed; see the error for whether to retry.
    Failed(StoreError),
}

impl SaveOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }

    /// Whether the caller should retry the save.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict => true,
            Self::Failed(e) => e.is_retryable(),
            Self::Written | Self::Skipped => false,
        }
    }

    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::Skipped => "skipped",
            Self::Conflict => "conflict",
            Self::Failed(_) => "failed",
        }
    }
}

/// Write policy for same-id concurrent saves.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum WriteMode {
    /// Unconditional overwrite; the last writer to finish wins.
    #[default]
    LastWriterWins,
    /// Overwrite only if the stored version is unchanged since it was read.
    Precondition,
}

/// Lifecycle state of a managed client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ClientState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
}
