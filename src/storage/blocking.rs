//! Blocking facade over the store.
//!
//! For callers without an async runtime. Each [`BlockingClient`] owns a small
//! Tokio runtime that drives its connection pool and checkpoint task; the
//! blocking operations enter that runtime with `block_on`.
//!
//! None of these methods may be called from inside an async context.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;

use crate::config::StoreConfig;
use crate::storage::StoreError;
use crate::storage::client::{Client, InitGuard, Slot};
use crate::storage::db::{Connector, SqliteConnector, SqlitePool, StoreTarget};
use crate::storage::error::bounded;
use crate::storage::query::{EventStream, fetch_event};
use crate::storage::repository::{finish, save_event};
use crate::storage::types::{ClientState, Event, EventFilter, SaveOutcome, WriteMode};

/// Shared handle to a live blocking client.
pub type BlockingClientHandle = Arc<BlockingClient>;

// =============================================================================
// Client
// =============================================================================

/// Blocking client: an async [`Client`] plus the runtime that drives it.
pub struct BlockingClient {
    runtime: Runtime,
    client: Client,
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl BlockingClient {
    fn connect(
        connector: &dyn Connector,
        target: &StoreTarget,
        limit: Duration,
    ) -> Result<Self, StoreError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hazard-store-io")
            .enable_all()
            .build()?;
        let client = runtime.block_on(bounded(limit, Client::connect(connector, target)))?;
        Ok(Self { runtime, client })
    }

    /// Process-unique client identifier.
    pub fn id(&self) -> u64 {
        self.client.id()
    }

    /// Store target identifier this client is bound to.
    pub fn project(&self) -> &str {
        self.client.project()
    }

    /// Connection pool for store operations.
    pub fn pool(&self) -> &SqlitePool {
        self.client.pool()
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Run `future` to completion on this client's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn close(&self, limit: Duration) {
        self.runtime.block_on(self.client.close(limit));
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Lazily constructs, shares and releases the [`BlockingClient`].
///
/// Same lifecycle as [`ClientManager`](crate::ClientManager), serialized by a
/// thread lock instead of an async one.
pub struct BlockingClientManager {
    config: StoreConfig,
    connector: Arc<dyn Connector>,
    slot: RwLock<Slot<BlockingClient>>,
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for BlockingClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClientManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl BlockingClientManager {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_connector(config, Arc::new(SqliteConnector))
    }

    pub fn with_connector(config: StoreConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            slot: RwLock::new(Slot::default()),
            init_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.slot.read().state()
    }

    /// Return the shared client, constructing it if absent.
    ///
    /// # Errors
    /// Same as [`ClientManager::acquire`](crate::ClientManager::acquire), plus
    /// `StoreError::Io` if the client runtime cannot be started.
    pub fn acquire(&self) -> Result<BlockingClientHandle, StoreError> {
        if let Some(client) = self.slot.read().ready(BlockingClient::is_closed) {
            return Ok(client);
        }

        let _guard = self.init_lock.lock();
        if let Some(client) = self.slot.read().ready(BlockingClient::is_closed) {
            return Ok(client);
        }

        let stale = self.slot.write().take_stale(BlockingClient::is_closed);
        if let Some(stale) = stale {
            tracing::debug!(client_id = stale.id(), "Replacing blocking client with a closed transport");
            stale.close(self.config.connect_timeout);
        }

        let target = self.config.target()?;
        let init = InitGuard::begin(&self.slot);
        tracing::debug!(project = %target.project, url = %target.url, "Initializing blocking client");

        match BlockingClient::connect(
            self.connector.as_ref(),
            &target,
            self.config.connect_timeout,
        ) {
            Ok(client) => {
                let client = Arc::new(client);
                init.complete(Arc::clone(&client));
                tracing::info!(client_id = client.id(), project = %target.project, "Blocking client ready");
                Ok(client)
            }
            Err(e) => {
                drop(init);
                tracing::warn!(project = %target.project, error = %e, "Blocking client initialization failed");
                Err(e)
            }
        }
    }

    /// Close and forget the cached client. Failures are logged only.
    pub fn release(&self) {
        let _guard = self.init_lock.lock();
        let Some(client) = self.slot.write().begin_close() else {
            return;
        };
        tracing::debug!(client_id = client.id(), "Releasing blocking client");

        client.close(self.config.connect_timeout);
        self.slot.write().finish_close();
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Blocking counterpart of [`EventRepository`](crate::EventRepository).
#[derive(Debug, Clone)]
pub struct BlockingEventRepository {
    clients: Arc<BlockingClientManager>,
    mode: WriteMode,
    timeout: Duration,
}

impl BlockingEventRepository {
    pub fn new(clients: Arc<BlockingClientManager>) -> Self {
        let mode = clients.config().write_mode;
        let timeout = clients.config().operation_timeout;
        Self {
            clients,
            mode,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Persist `event` unless the stored record is at least as recent.
    ///
    /// Acquire, read and write share one time budget. A client construction
    /// that outlasts it is still bounded by `connect_timeout` and then
    /// reported as a timeout.
    pub fn save(&self, event: &Event) -> SaveOutcome {
        let started = Instant::now();
        let result = self.clients.acquire().and_then(|client| {
            let budget = remaining(started, self.timeout)?;
            client.block_on(bounded(budget, save_event(client.pool(), event, self.mode)))
        });
        finish(event, result)
    }
}

// =============================================================================
// Query engine
// =============================================================================

/// Blocking counterpart of [`EventQueryEngine`](crate::EventQueryEngine).
#[derive(Debug, Clone)]
pub struct BlockingEventQueryEngine {
    clients: Arc<BlockingClientManager>,
    timeout: Duration,
}

impl BlockingEventQueryEngine {
    pub fn new(clients: Arc<BlockingClientManager>) -> Self {
        let timeout = clients.config().operation_timeout;
        Self { clients, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Look up a single event; malformed records read as `None`.
    pub fn get(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let started = Instant::now();
        let client = self.clients.acquire()?;
        let budget = remaining(started, self.timeout)?;
        client.block_on(bounded(budget, fetch_event(client.pool(), id)))
    }

    /// Iterate events matching `filter`, most recent first.
    pub fn list(&self, filter: EventFilter) -> Result<BlockingEventIter, StoreError> {
        if filter.is_empty() {
            return Ok(BlockingEventIter {
                rx: EventStream::empty().into_receiver(),
                _client: None,
            });
        }
        let client = self.clients.acquire()?;
        let stream = EventStream::spawn(
            client.runtime.handle(),
            client.pool().clone(),
            filter,
            self.timeout,
        );
        Ok(BlockingEventIter {
            rx: stream.into_receiver(),
            _client: Some(client),
        })
    }
}

/// Time left of `budget` since `started`.
fn remaining(started: Instant, budget: Duration) -> Result<Duration, StoreError> {
    budget
        .checked_sub(started.elapsed())
        .filter(|left| !left.is_zero())
        .ok_or(StoreError::Timeout(budget))
}

/// Iterator over one blocking listing.
///
/// Holds the client so its runtime keeps producing until the iterator is
/// exhausted or dropped.
pub struct BlockingEventIter {
    rx: mpsc::Receiver<Result<Event, StoreError>>,
    _client: Option<BlockingClientHandle>,
}

impl std::fmt::Debug for BlockingEventIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingEventIter").finish_non_exhaustive()
    }
}

impl Iterator for BlockingEventIter {
    type Item = Result<Event, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}
