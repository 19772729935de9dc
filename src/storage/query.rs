//! Event read path.
//!
//! [`EventQueryEngine::list`] turns an [`EventFilter`] into one SQL query and
//! streams validated events, most recent first. Stored documents that no
//! longer decode or validate are skipped and logged; the rest of the listing
//! is still delivered.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use sqlx::{QueryBuilder, Sqlite};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::storage::StoreError;
use crate::storage::client::ClientManager;
use crate::storage::db::SqlitePool;
use crate::storage::error::bounded;
use crate::storage::types::{Event, EventFilter};

/// Rows buffered ahead of the consumer.
const STREAM_BUFFER: usize = 64;

// =============================================================================
// Engine
// =============================================================================

/// Filtered, ordered reads over stored events.
#[derive(Clone)]
pub struct EventQueryEngine {
    clients: Arc<ClientManager>,
    timeout: Duration,
}

impl std::fmt::Debug for EventQueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueryEngine")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EventQueryEngine {
    /// Create an engine using the manager's operation timeout.
    pub fn new(clients: Arc<ClientManager>) -> Self {
        let timeout = clients.config().operation_timeout;
        Self { clients, timeout }
    }

    /// Override the time bound for lookups and row fetches.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Look up a single event.
    ///
    /// A stored record that fails validation is logged and reported as `None`.
    pub async fn get(&self, id: &str) -> Result<Option<Event>, StoreError> {
        bounded(self.timeout, async {
            let client = self.clients.acquire().await?;
            fetch_event(client.pool(), id).await
        })
        .await
    }

    /// Stream events matching `filter`, ordered by `updated_at` descending.
    ///
    /// The stream is consumed once. A transport failure or a row fetch
    /// exceeding the timeout is yielded as a final `Err` item.
    pub async fn list(&self, filter: EventFilter) -> Result<EventStream, StoreError> {
        if filter.is_empty() {
            return Ok(EventStream::empty());
        }
        let client = bounded(self.timeout, self.clients.acquire()).await?;
        Ok(EventStream::spawn(
            &Handle::current(),
            client.pool().clone(),
            filter,
            self.timeout,
        ))
    }
}

// =============================================================================
// Stream
// =============================================================================

/// Lazily produced, finite sequence of events from one listing.
///
/// Rows are fetched by a background task and handed over through a bounded
/// channel, so the query only runs ahead of the consumer by a small buffer.
pub struct EventStream {
    inner: ReceiverStream<Result<Event, StoreError>>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

impl EventStream {
    /// Start the producer task on `runtime`.
    pub(crate) fn spawn(
        runtime: &Handle,
        pool: SqlitePool,
        filter: EventFilter,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        runtime.spawn(produce(pool, filter, timeout, tx));
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// A stream that ends immediately.
    pub(crate) fn empty() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    pub(crate) fn into_receiver(self) -> mpsc::Receiver<Result<Event, StoreError>> {
        self.inner.into_inner()
    }

    /// Drain the stream, stopping at the first error.
    pub async fn try_collect_vec(self) -> Result<Vec<Event>, StoreError> {
        self.collect().await
    }
}

impl Stream for EventStream {
    type Item = Result<Event, StoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Run the listing query and forward decoded events until done.
async fn produce(
    pool: SqlitePool,
    filter: EventFilter,
    timeout: Duration,
    tx: mpsc::Sender<Result<Event, StoreError>>,
) {
    let mut query = list_query(&filter);
    let mut rows = query.build_query_as::<EventRow>().fetch(pool.inner());
    let mut sent = 0usize;
    let mut skipped = 0usize;

    loop {
        let row = match tokio::time::timeout(timeout, rows.next()).await {
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "Event listing stalled, aborting");
                let _ = tx.send(Err(StoreError::Timeout(timeout))).await;
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "Event listing failed");
                let _ = tx.send(Err(StoreError::from(e))).await;
                break;
            }
            Ok(Some(Ok(row))) => row,
        };

        match row.decode() {
            Ok(event) => {
                if tx.send(Ok(event)).await.is_err() {
                    tracing::debug!("Event stream dropped by consumer");
                    break;
                }
                sent += 1;
            }
            Err(e) => {
                skipped += 1;
                tracing::error!(event_id = %row.id, error = %e, "Skipping malformed stored event");
            }
        }
    }

    tracing::debug!(sent, skipped, "Event listing finished");
}

// =============================================================================
// SQL
// =============================================================================

/// Raw stored document.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: String,
    pub body: String,
}

impl EventRow {
    /// Decode and validate the stored document.
    pub(crate) fn decode(&self) -> Result<Event, StoreError> {
        let event: Event = serde_json::from_str(&self.body)
            .map_err(|e| StoreError::Validation(format!("undecodable document: {e}")))?;
        event.validate()?;
        if event.id != self.id {
            return Err(StoreError::Validation(format!(
                "document id '{}' does not match key '{}'",
                event.id, self.id
            )));
        }
        Ok(event)
    }
}

/// Build the listing query. Predicates are ANDed.
fn list_query(filter: &EventFilter) -> QueryBuilder<'_, Sqlite> {
    let mut qb = QueryBuilder::new("SELECT id, body FROM events WHERE 1 = 1");

    if let Some(after) = filter.updated_after {
        qb.push(" AND updated_at >= ")
            .push_bind(after.timestamp_micros());
    }

    if let Some(codes) = &filter.area_codes {
        qb.push(" AND id IN (SELECT event_id FROM event_areas WHERE code IN (");
        let mut separated = qb.separated(", ");
        for code in codes {
            separated.push_bind(code.as_str());
        }
        separated.push_unseparated("))");
    }

    qb.push(" ORDER BY updated_at DESC, id ASC LIMIT ")
        .push_bind(i64::from(filter.effective_limit()));
    qb
}

/// Point lookup with skip-and-log on corruption.
pub(crate) async fn fetch_event(pool: &SqlitePool, id: &str) -> Result<Option<Event>, StoreError> {
    let row: Option<EventRow> = sqlx::query_as("SELECT id, body FROM events WHERE id = ?")
        .bind(id)
        .fetch_optional(pool.inner())
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    match row.decode() {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            tracing::error!(event_id = %id, error = %e, "Stored event is malformed, treating as absent");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::repository::EventRepository;
    use crate::storage::types::Area;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::{TempDir, tempdir};

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 8, hour, min, 0).unwrap()
    }

    fn manager(dir: &TempDir) -> Arc<ClientManager> {
        Arc::new(ClientManager::new(StoreConfig {
            project: Some("query".to_string()),
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..StoreConfig::default()
        }))
    }

    async fn seed(clients: &Arc<ClientManager>, events: &[Event]) {
        let repo = EventRepository::new(Arc::clone(clients));
        for event in events {
            assert!(repo.save(event).await.is_written(), "seed {}", event.id);
        }
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_list_query_sql() {
        let filter = EventFilter::new(5)
            .updated_after(at(10, 0))
            .area_codes(["1", "2"]);
        let query = list_query(&filter);
        assert_eq!(
            query.sql(),
            "SELECT id, body FROM events WHERE 1 = 1 AND updated_at >= ? \
             AND id IN (SELECT event_id FROM event_areas WHERE code IN (?, ?)) \
             ORDER BY updated_at DESC, id ASC LIMIT ?"
        );
    }

    #[test]
    fn test_row_decode_rejects_mismatched_id() {
        let row = EventRow {
            id: "a".to_string(),
            body: r#"{"id":"b","areas":[],"updated_at":"2024-08-08T10:00:00Z"}"#.to_string(),
        };
        assert!(matches!(row.decode(), Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_list_orders_most_recent_first_and_limits() {
        let dir = tempdir().unwrap();
        let clients = manager(&dir);
        seed(
            &clients,
            &[
                Event::new("a", at(10, 0)).with_area(Area::new("X")),
                Event::new("b", at(10, 5)).with_area(Area::new("X")),
                Event::new("c", at(10, 10)).with_area(Area::new("X")),
            ],
        )
        .await;

        let engine = EventQueryEngine::new(Arc::clone(&clients));
        let events = engine
            .list(EventFilter::new(2).area_codes(["X"]))
            .await
            .unwrap()
            .try_collect_vec()
            .await
            .unwrap();
        assert_eq!(ids(&events), ["c", "b"]);

        clients.release().await;
    }

    #[tokio::test]
    async fn test_empty_area_set_matches_nothing() {
        let dir = tempdir().unwrap();
        let clients = manager(&dir);
        seed(&clients, &[Event::new("a", at(10, 0)).with_area(Area::new("X"))]).await;

        let engine = EventQueryEngine::new(Arc::clone(&clients));
        let events = engine
            .list(EventFilter::new(10).area_codes(Vec::<String>::new()))
            .await
            .unwrap()
            .try_collect_vec()
            .await
            .unwrap();
        assert!(events.is_empty());

        clients.release().await;
    }

    #[tokio::test]
    async fn test_get_missing_and_malformed() {
        let dir = tempdir().unwrap();
        let clients = manager(&dir);
        seed(&clients, &[Event::new("good", at(9, 0))]).await;

        let client = clients.acquire().await.unwrap();
        sqlx::query("INSERT INTO events (id, updated_at, version, body, stored_at) VALUES (?, ?, 1, ?, 0)")
            .bind("bad")
            .bind(at(9, 30).timestamp_micros())
            .bind("{not json")
            .execute(client.pool().inner())
            .await
            .unwrap();
        drop(client);

        let engine = EventQueryEngine::new(Arc::clone(&clients));
        assert_eq!(engine.get("good").await.unwrap().unwrap().id, "good");
        assert!(engine.get("bad").await.unwrap().is_none());
        assert!(engine.get("nope").await.unwrap().is_none());

        clients.release().await;
    }

    #[tokio::test]
    async fn test_dropping_stream_early_stops_producer() {
        let dir = tempdir().unwrap();
        let clients = manager(&dir);
        let events: Vec<Event> = (0..10)
            .map(|i| Event::new(format!("ev-{i}"), at(10, i)))
            .collect();
        seed(&clients, &events).await;

        let engine = EventQueryEngine::new(Arc::clone(&clients));
        let mut stream = engine.list(EventFilter::new(10)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, "ev-9");
        drop(stream);

        clients.release().await;
        assert_eq!(clients.state(), crate::ClientState::Uninitialized);
    }
}
