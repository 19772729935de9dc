//! Event write path.
//!
//! [`EventRepository::save`] applies a per-id last-write-wins policy with a
//! one-second tolerance: an incoming event replaces the stored record only if
//! its `updated_at` is more than one second newer. Re-deliveries of an
//! unchanged event therefore never rewrite the record.
//!
//! Reading the stored record and overwriting it are separate statements. In
//! [`WriteMode::LastWriterWins`] two concurrent saves of the same id race and
//! the last overwrite wins. [`WriteMode::Precondition`] makes the write
//! conditional on the version observed at read time and reports a lost race as
//! [`SaveOutcome::Conflict`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::storage::StoreError;
use crate::storage::client::ClientManager;
use crate::storage::db::SqlitePool;
use crate::storage::error::bounded;
use crate::storage::types::{Event, SaveOutcome, WriteMode};

/// Grace period within which an incoming update is not considered newer.
pub const TOLERANCE: TimeDelta = TimeDelta::seconds(1);

/// Supersession key and version of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoredVersion {
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// Whether `incoming` supersedes a record stored with `stored`.
///
/// A record stored within the tolerance of the latest representable time
/// can never be superseded.
pub fn supersedes(incoming: DateTime<Utc>, stored: DateTime<Utc>) -> bool {
    stored
        .checked_add_signed(TOLERANCE)
        .is_some_and(|limit| incoming > limit)
}

// =============================================================================
// Repository
// =============================================================================

/// Deduplicating event writer.
#[derive(Clone)]
pub struct EventRepository {
    clients: Arc<ClientManager>,
    mode: WriteMode,
    timeout: Duration,
}

impl std::fmt::Debug for EventRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRepository")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EventRepository {
    /// Create a repository using the manager's write mode and operation timeout.
    pub fn new(clients: Arc<ClientManager>) -> Self {
        let mode = clients.config().write_mode;
        let timeout = clients.config().operation_timeout;
        Self {
            clients,
            mode,
            timeout,
        }
    }

    /// Override the per-save time bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the write mode.
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn write_mode(&self) -> WriteMode {
        self.mode
    }

    /// Persist `event` unless the stored record is at least as recent.
    ///
    /// Never returns an error: failures are reported as
    /// [`SaveOutcome::Failed`] so ingestion loops can retry.
    pub async fn save(&self, event: &Event) -> SaveOutcome {
        let result = bounded(self.timeout, async {
            let client = self.clients.acquire().await?;
            save_event(client.pool(), event, self.mode).await
        })
        .await;

        finish(event, result)
    }
}

/// Log and fold a save result into an outcome.
pub(crate) fn finish(event: &Event, result: Result<SaveOutcome, StoreError>) -> SaveOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                retryable = e.is_retryable(),
                "Event save failed"
            );
            SaveOutcome::Failed(e)
        }
    }
}

// =============================================================================
// Store operations
// =============================================================================

/// Validate, compare against the stored record, and write if newer.
pub(crate) async fn save_event(
    pool: &SqlitePool,
    event: &Event,
    mode: WriteMode,
) -> Result<SaveOutcome, StoreError> {
    event.validate()?;

    let stored = read_version(pool, &event.id).await?;
    if let Some(stored) = stored
        && !supersedes(event.updated_at, stored.updated_at)
    {
        tracing::warn!(
            event_id = %event.id,
            stored_updated_at = %stored.updated_at,
            incoming_updated_at = %event.updated_at,
            "Event is not newer than stored record, skipping"
        );
        return Ok(SaveOutcome::Skipped);
    }

    let precondition = match mode {
        WriteMode::LastWriterWins => Precondition::Unconditional,
        WriteMode::Precondition => match stored {
            Some(s) => Precondition::Version(s.version),
            None => Precondition::Absent,
        },
    };

    write_event(pool, event, precondition).await
}

/// Read the supersession key of the stored record, if any.
pub(crate) async fn read_version(
    pool: &SqlitePool,
    id: &str,
) -> Result<Option<StoredVersion>, StoreError> {
    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT updated_at, version FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(pool.inner())
            .await?;

    row.map(|(micros, version)| {
        let updated_at = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
            StoreError::Validation(format!(
                "stored updated_at out of range for event '{id}': {micros}"
            ))
        })?;
        Ok(StoredVersion {
            updated_at,
            version,
        })
    })
    .transpose()
}

/// Condition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Precondition {
    /// Unconditional overwrite.
    Unconditional,
    /// Write only if no record exists.
    Absent,
    /// Write only if the stored version still equals this one.
    Version(i64),
}

/// Overwrite the full document and its area rows in one transaction.
pub(crate) async fn write_event(
    pool: &SqlitePool,
    event: &Event,
    precondition: Precondition,
) -> Result<SaveOutcome, StoreError> {
    let body = serde_json::to_string(event)?;
    let updated_at = event.updated_at.timestamp_micros();
    let stored_at = Utc::now().timestamp_micros();

    let mut tx = pool.inner().begin().await?;

    let affected = match precondition {
        Precondition::Unconditional => {
            sqlx::query(
                "INSERT INTO events (id, updated_at, version, body, stored_at)
                 VALUES (?, ?, 1, ?, ?)
                 ON CONFLICT (id) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    version = events.version + 1,
                    body = excluded.body,
                    stored_at = excluded.stored_at",
            )
            .bind(&event.id)
            .bind(updated_at)
            .bind(&body)
            .bind(stored_at)
            .execute(&mut *tx)
            .await?
        }
        Precondition::Absent => {
            sqlx::query(
                "INSERT INTO events (id, updated_at, version, body, stored_at)
                 VALUES (?, ?, 1, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&event.id)
            .bind(updated_at)
            .bind(&body)
            .bind(stored_at)
            .execute(&mut *tx)
            .await?
        }
        Precondition::Version(version) => {
            sqlx::query(
                "UPDATE events
                 SET updated_at = ?, version = version + 1, body = ?, stored_at = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(updated_at)
            .bind(&body)
            .bind(stored_at)
            .bind(&event.id)
            .bind(version)
            .execute(&mut *tx)
            .await?
        }
    }
    .rows_affected();

    if affected == 0 {
        tx.rollback().await?;
        tracing::warn!(
            event_id = %event.id,
            ?precondition,
            "Stored record changed since it was read, write rejected"
        );
        return Ok(SaveOutcome::Conflict);
    }

    sqlx::query("DELETE FROM event_areas WHERE event_id = ?")
        .bind(&event.id)
        .execute(&mut *tx)
        .await?;
    for code in event.area_codes() {
        sqlx::query("INSERT INTO event_areas (event_id, code) VALUES (?, ?)")
            .bind(&event.id)
            .bind(code)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    tracing::debug!(event_id = %event.id, updated_at = %event.updated_at, "Event written");
    Ok(SaveOutcome::Written)
}
