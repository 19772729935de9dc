//! Store Integration Tests
//!
//! End-to-end behavior of client lifecycle, deduplicating writes and queries
//! through the public API, on temporary SQLite databases.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use hazard_store::{
    Area, BlockingClientManager, BlockingEventQueryEngine, BlockingEventRepository, ClientManager,
    ClientState, Connector, Event, EventFilter, EventQueryEngine, EventRepository, SaveOutcome,
    SqliteConnector, SqlitePool, StoreConfig, StoreError, StoreTarget, WriteMode,
};
use tempfile::{TempDir, tempdir};
use tokio::sync::Barrier;
use tokio_stream::StreamExt;

// =============================================================================
// Test Helpers
// =============================================================================

/// Counts constructions and optionally delays each connect.
#[derive(Default)]
struct CountingConnector {
    connects: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, target: &StoreTarget) -> Result<SqlitePool, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        SqliteConnector.connect(target).await
    }
}

/// Hangs on the first connect only.
#[derive(Default)]
struct StallOnceConnector {
    stalled: AtomicBool,
}

#[async_trait]
impl Connector for StallOnceConnector {
    async fn connect(&self, target: &StoreTarget) -> Result<SqlitePool, StoreError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        SqliteConnector.connect(target).await
    }
}

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        project: Some("integration".to_string()),
        data_dir: dir.path().to_string_lossy().into_owned(),
        ..StoreConfig::default()
    }
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 8, h, m, s).unwrap()
}

fn alert(id: &str, updated_at: DateTime<Utc>, codes: &[&str]) -> Event {
    codes
        .iter()
        .fold(Event::new(id, updated_at), |event, code| {
            event.with_area(Area::new(*code).with_field("name", format!("area {code}")))
        })
        .with_field("title", "Heavy rain warning")
}

struct Store {
    _dir: TempDir,
    clients: Arc<ClientManager>,
    repo: EventRepository,
    engine: EventQueryEngine,
}

fn open_store() -> Store {
    let dir = tempdir().unwrap();
    let clients = Arc::new(ClientManager::new(store_config(&dir)));
    Store {
        repo: EventRepository::new(Arc::clone(&clients)),
        engine: EventQueryEngine::new(Arc::clone(&clients)),
        clients,
        _dir: dir,
    }
}

fn ids(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.id.as_str()).collect()
}

// =============================================================================
// Write Path Tests
// =============================================================================

#[tokio::test]
async fn test_idempotent_save() {
    let store = open_store();
    let event = alert("jma-001", at(10, 0, 0), &["13101", "13102"]);

    assert!(matches!(store.repo.save(&event).await, SaveOutcome::Written));
    assert!(matches!(store.repo.save(&event).await, SaveOutcome::Skipped));

    let stored = store.engine.get("jma-001").await.unwrap().unwrap();
    assert_eq!(stored, event);

    store.clients.release().await;
}

#[tokio::test]
async fn test_tolerance_window() {
    let store = open_store();
    let t = at(10, 0, 0);
    assert!(store.repo.save(&alert("ev", t, &["1"])).await.is_written());

    let half = alert("ev", t + TimeDelta::milliseconds(500), &["1", "2"]);
    assert!(matches!(store.repo.save(&half).await, SaveOutcome::Skipped));

    let exactly_one = alert("ev", t + TimeDelta::seconds(1), &["1", "2"]);
    assert!(matches!(store.repo.save(&exactly_one).await, SaveOutcome::Skipped));

    let later = alert("ev", t + TimeDelta::milliseconds(1500), &["1", "2"]);
    assert!(matches!(store.repo.save(&later).await, SaveOutcome::Written));

    let stored = store.engine.get("ev").await.unwrap().unwrap();
    assert_eq!(stored.updated_at, later.updated_at);
    assert_eq!(stored.areas.len(), 2);

    store.clients.release().await;
}

#[tokio::test]
async fn test_older_event_is_skipped() {
    let store = open_store();
    assert!(store.repo.save(&alert("ev", at(10, 5, 0), &["1"])).await.is_written());
    assert!(matches!(
        store.repo.save(&alert("ev", at(10, 0, 0), &["1"])).await,
        SaveOutcome::Skipped
    ));
    store.clients.release().await;
}

#[tokio::test]
async fn test_save_timeout_is_reported_as_failure() {
    let dir = tempdir().unwrap();
    let connector = Arc::new(CountingConnector {
        delay: Duration::from_millis(500),
        ..CountingConnector::default()
    });
    let clients = Arc::new(ClientManager::with_connector(store_config(&dir), connector));
    let repo = EventRepository::new(Arc::clone(&clients)).with_timeout(Duration::from_millis(50));

    let outcome = repo.save(&alert("ev", at(10, 0, 0), &["1"])).await;
    assert!(matches!(outcome, SaveOutcome::Failed(StoreError::Timeout(_))));
    assert!(outcome.is_retryable());
    assert_eq!(clients.state(), ClientState::Uninitialized);
}

#[tokio::test]
async fn test_precondition_mode_through_config() {
    let dir = tempdir().unwrap();
    let clients = Arc::new(ClientManager::new(StoreConfig {
        write_mode: WriteMode::Precondition,
        ..store_config(&dir)
    }));
    let repo = EventRepository::new(Arc::clone(&clients));
    assert_eq!(repo.write_mode(), WriteMode::Precondition);

    assert!(repo.save(&alert("ev", at(10, 0, 0), &["1"])).await.is_written());
    assert!(repo.save(&alert("ev", at(10, 1, 0), &["1"])).await.is_written());
    assert!(matches!(
        repo.save(&alert("ev", at(10, 1, 0), &["1"])).await,
        SaveOutcome::Skipped
    ));

    clients.release().await;
}

// =============================================================================
// Client Lifecycle Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_construction_under_concurrency() {
    const CALLERS: usize = 16;

    let dir = tempdir().unwrap();
    let connector = Arc::new(CountingConnector {
        delay: Duration::from_millis(50),
        ..CountingConnector::default()
    });
    let clients = Arc::new(ClientManager::with_connector(
        store_config(&dir),
        connector.clone(),
    ));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let clients = Arc::clone(&clients);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                clients.acquire().await.unwrap().id()
            })
        })
        .collect();

    let mut client_ids = Vec::with_capacity(CALLERS);
    for task in tasks {
        client_ids.push(task.await.unwrap());
    }

    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert!(client_ids.iter().all(|id| *id == client_ids[0]));

    clients.release().await;
}

#[tokio::test]
async fn test_post_release_reinitialization() {
    let dir = tempdir().unwrap();
    let connector = Arc::new(CountingConnector::default());
    let clients = Arc::new(ClientManager::with_connector(
        store_config(&dir),
        connector.clone(),
    ));

    let first = clients.acquire().await.unwrap();
    clients.release().await;
    assert_eq!(clients.state(), ClientState::Uninitialized);
    assert!(first.is_closed());
    assert!(
        sqlx::query("SELECT 1")
            .execute(first.pool().inner())
            .await
            .is_err()
    );

    let second = clients.acquire().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert!(!second.is_closed());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    // Data written before the release is still there
    let repo = EventRepository::new(Arc::clone(&clients));
    assert!(repo.save(&alert("ev", at(10, 0, 0), &["1"])).await.is_written());
    clients.release().await;
    assert!(matches!(
        repo.save(&alert("ev", at(10, 0, 0), &["1"])).await,
        SaveOutcome::Skipped
    ));

    clients.release().await;
}

#[tokio::test]
async fn test_acquire_timeout_leaves_slot_empty() {
    let dir = tempdir().unwrap();
    let clients = ClientManager::with_connector(
        StoreConfig {
            connect_timeout: Duration::from_millis(100),
            ..store_config(&dir)
        },
        Arc::new(StallOnceConnector::default()),
    );

    let err = clients.acquire().await.unwrap_err();
    assert!(matches!(err, StoreError::Timeout(_)));
    assert_eq!(clients.state(), ClientState::Uninitialized);

    let client = clients.acquire().await.unwrap();
    assert_eq!(clients.state(), ClientState::Ready);
    assert!(!client.is_closed());

    clients.release().await;
}

#[tokio::test]
async fn test_emulator_url_override() {
    let clients = Arc::new(ClientManager::new(StoreConfig {
        project: Some("emulated".to_string()),
        emulator_url: Some("sqlite::memory:".to_string()),
        ..StoreConfig::default()
    }));
    let repo = EventRepository::new(Arc::clone(&clients));
    let engine = EventQueryEngine::new(Arc::clone(&clients));

    assert!(repo.save(&alert("ev", at(10, 0, 0), &["1"])).await.is_written());
    assert!(engine.get("ev").await.unwrap().is_some());
    assert_eq!(clients.acquire().await.unwrap().project(), "emulated");

    clients.release().await;
}

// =============================================================================
// Read Path Tests
// =============================================================================

#[tokio::test]
async fn test_query_ordering_and_limit() {
    let store = open_store();
    for (id, minute) in [("a", 0), ("b", 5), ("c", 10)] {
        assert!(store.repo.save(&alert(id, at(10, minute, 0), &["X"])).await.is_written());
    }

    let events = store
        .engine
        .list(EventFilter::new(2).area_codes(["X"]))
        .await
        .unwrap()
        .try_collect_vec()
        .await
        .unwrap();
    assert_eq!(ids(&events), ["c", "b"]);
    assert_eq!(events[0].updated_at, at(10, 10, 0));
    assert_eq!(events[1].updated_at, at(10, 5, 0));

    store.clients.release().await;
}

#[tokio::test]
async fn test_filter_conjunction() {
    let store = open_store();
    let cutoff = at(12, 0, 0);
    let seed = [
        alert("old-match-area", at(11, 0, 0), &["13101"]),
        alert("new-other-area", at(12, 30, 0), &["27100"]),
        alert("new-match-area", at(12, 15, 0), &["13101", "27100"]),
        alert("at-cutoff", cutoff, &["13101"]),
    ];
    for event in &seed {
        assert!(store.repo.save(event).await.is_written());
    }

    let events = store
        .engine
        .list(EventFilter::new(100).updated_after(cutoff).area_codes(["13101"]))
        .await
        .unwrap()
        .try_collect_vec()
        .await
        .unwrap();
    assert_eq!(ids(&events), ["new-match-area", "at-cutoff"]);

    // Any of several codes
    let events = store
        .engine
        .list(EventFilter::new(100).area_codes(["27100", "99999"]))
        .await
        .unwrap()
        .try_collect_vec()
        .await
        .unwrap();
    assert_eq!(ids(&events), ["new-other-area", "new-match-area"]);

    store.clients.release().await;
}

#[tokio::test]
async fn test_ties_ordered_by_id() {
    let store = open_store();
    for id in ["b", "c", "a"] {
        assert!(store.repo.save(&alert(id, at(9, 0, 0), &["1"])).await.is_written());
    }

    let events = store
        .engine
        .list(EventFilter::new(10))
        .await
        .unwrap()
        .try_collect_vec()
        .await
        .unwrap();
    assert_eq!(ids(&events), ["a", "b", "c"]);

    store.clients.release().await;
}

#[tokio::test]
async fn test_corrupt_record_isolation() {
    let store = open_store();
    for (id, minute) in [("good-1", 0), ("good-2", 20)] {
        assert!(store.repo.save(&alert(id, at(10, minute, 0), &["X"])).await.is_written());
    }

    // A record with a blank area code fails validation on read
    let client = store.clients.acquire().await.unwrap();
    let body = r#"{"id":"corrupt","areas":[{"code":""}],"updated_at":"2024-08-08T10:10:00Z"}"#;
    sqlx::query(
        "INSERT INTO events (id, updated_at, version, body, stored_at) VALUES (?, ?, 1, ?, 0)",
    )
    .bind("corrupt")
    .bind(at(10, 10, 0).timestamp_micros())
    .bind(body)
    .execute(client.pool().inner())
    .await
    .unwrap();
    sqlx::query("INSERT INTO event_areas (event_id, code) VALUES ('corrupt', 'X')")
        .execute(client.pool().inner())
        .await
        .unwrap();

    let mut stream = store
        .engine
        .list(EventFilter::new(10).area_codes(["X"]))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        seen.push(item.unwrap().id);
    }
    assert_eq!(seen, ["good-2", "good-1"]);
    assert!(store.engine.get("corrupt").await.unwrap().is_none());

    store.clients.release().await;
}

#[tokio::test]
async fn test_list_after_release_reports_error() {
    let store = open_store();
    assert!(store.repo.save(&alert("ev", at(10, 0, 0), &["1"])).await.is_written());

    let stream = store.engine.list(EventFilter::new(10)).await.unwrap();
    store.clients.release().await;

    // The stream either finished before the release or surfaces a transport error.
    let items: Vec<_> = stream.collect().await;
    assert!(items.len() <= 1);
    if let Some(Err(e)) = items.first() {
        assert!(e.is_retryable());
    }
}

// =============================================================================
// Blocking API Tests
// =============================================================================

#[test]
fn test_blocking_idempotent_save_and_ordering() {
    let dir = tempdir().unwrap();
    let clients = Arc::new(BlockingClientManager::new(store_config(&dir)));
    let repo = BlockingEventRepository::new(Arc::clone(&clients));
    let engine = BlockingEventQueryEngine::new(Arc::clone(&clients));

    let event = alert("a", at(10, 0, 0), &["X"]);
    assert!(matches!(repo.save(&event), SaveOutcome::Written));
    assert!(matches!(repo.save(&event), SaveOutcome::Skipped));
    assert!(repo.save(&alert("b", at(10, 5, 0), &["X"])).is_written());
    assert!(repo.save(&alert("c", at(10, 10, 0), &["X"])).is_written());

    let listed: Vec<String> = engine
        .list(EventFilter::new(2).area_codes(["X"]))
        .unwrap()
        .map(|item| item.unwrap().id)
        .collect();
    assert_eq!(listed, ["c", "b"]);
    assert_eq!(engine.get("a").unwrap(), Some(event));

    clients.release();
}

#[test]
fn test_blocking_single_construction_across_threads() {
    const CALLERS: usize = 8;

    let dir = tempdir().unwrap();
    let connector = Arc::new(CountingConnector {
        delay: Duration::from_millis(50),
        ..CountingConnector::default()
    });
    let clients = BlockingClientManager::with_connector(store_config(&dir), connector.clone());
    let barrier = std::sync::Barrier::new(CALLERS);

    let client_ids: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    clients.acquire().unwrap().id()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert!(client_ids.iter().all(|id| *id == client_ids[0]));

    let first = clients.acquire().unwrap();
    clients.release();
    assert!(first.is_closed());
    let second = clients.acquire().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    clients.release();
}
