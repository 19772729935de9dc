//! Feed ingestion.
//!
//! Reads one JSON event per line and saves each through an
//! [`EventRepository`], retrying transient failures with exponential backoff.
//! Only configuration failures stop the run; everything else is counted in the
//! returned [`IngestSummary`].

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::IngestConfig;
use crate::storage::{Event, EventRepository, SaveOutcome, StoreError};

/// Per-run outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Events written to the store.
    pub written: u64,
    /// Events already stored at the same or a newer time.
    pub skipped: u64,
    /// Conflict outcomes observed, including ones resolved by a retry.
    pub conflicts: u64,
    /// Lines that did not parse or failed validation.
    pub invalid: u64,
    /// Events still failing after the last attempt.
    pub failed: u64,
}

impl IngestSummary {
    /// Number of lines processed.
    pub fn total(&self) -> u64 {
        self.written + self.skipped + self.invalid + self.failed
    }
}

/// Save every event read from `reader`.
///
/// Blank lines are ignored.
///
/// # Errors
/// - `StoreError::Configuration` if the store target is not configured
/// - `StoreError::Io` if reading the feed fails
pub async fn ingest<R>(
    repo: &EventRepository,
    policy: &IngestConfig,
    reader: R,
) -> Result<IngestSummary, StoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Unparseable feed line, skipping");
                summary.invalid += 1;
                continue;
            }
        };

        match save_with_retry(repo, policy, &event, &mut summary).await? {
            SaveOutcome::Written => summary.written += 1,
            SaveOutcome::Skipped => summary.skipped += 1,
            SaveOutcome::Failed(e) if !e.is_retryable() => summary.invalid += 1,
            SaveOutcome::Conflict | SaveOutcome::Failed(_) => {
                tracing::error!(event_id = %event.id, line = line_no, "Giving up on event");
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        written = summary.written,
        skipped = summary.skipped,
        conflicts = summary.conflicts,
        invalid = summary.invalid,
        failed = summary.failed,
        "Ingestion finished"
    );
    Ok(summary)
}

/// Save `event`, retrying retryable outcomes up to `policy.max_attempts`.
async fn save_with_retry(
    repo: &EventRepository,
    policy: &IngestConfig,
    event: &Event,
    summary: &mut IngestSummary,
) -> Result<SaveOutcome, StoreError> {
    let mut attempt = 1;
    loop {
        let outcome = repo.save(event).await;
        if matches!(outcome, SaveOutcome::Conflict) {
            summary.conflicts += 1;
        }
        match outcome {
            SaveOutcome::Failed(e) if e.is_fatal() => return Err(e),
            outcome if outcome.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff(policy, attempt);
                tracing::warn!(
                    event_id = %event.id,
                    attempt,
                    outcome = outcome.kind(),
                    delay = ?delay,
                    "Retrying event save"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return Ok(outcome),
        }
    }
}

/// Delay after the `attempt`-th failure: doubling from the initial backoff.
fn backoff(policy: &IngestConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    policy
        .initial_backoff
        .saturating_mul(factor)
        .min(policy.max_backoff)
}
