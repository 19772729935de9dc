//! Client lifecycle management.
//!
//! A [`ClientManager`] owns the single shared [`Client`] for a store target.
//! The client is built lazily on the first [`acquire`](ClientManager::acquire)
//! and dropped from the cache by [`release`](ClientManager::release); the next
//! acquire builds a fresh one.
//!
//! Acquisition is double-checked: the cached slot is read under a shared lock
//! and returned immediately when ready. Only an empty slot takes the exclusive
//! initialization lock, re-checks, and connects. Neither lock is held while a
//! caller uses the handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::storage::StoreError;
use crate::storage::db::{Connector, SqliteConnector, SqlitePool, StoreTarget};
use crate::storage::error::bounded;
use crate::storage::types::ClientState;

/// Shared handle to a live client.
pub type ClientHandle = Arc<Client>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Lower bound for the checkpoint period; `tokio::time::interval` rejects zero.
const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Client
// =============================================================================

/// Live connection to the backing store.
///
/// Owns the connection pool and a background WAL checkpoint task.
pub struct Client {
    id: u64,
    project: String,
    pool: SqlitePool,
    checkpointer: parking_lot::Mutex<Option<Checkpointer>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect through `connector` and start the checkpoint task.
    ///
    /// Must run inside a Tokio runtime.
    pub(crate) async fn connect(
        connector: &dyn Connector,
        target: &StoreTarget,
    ) -> Result<Self, StoreError> {
        let pool = connector.connect(target).await?;
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let checkpointer = Checkpointer::spawn(id, pool.clone(), target.checkpoint_interval);

        Ok(Self {
            id,
            project: target.project.clone(),
            pool,
            checkpointer: parking_lot::Mutex::new(Some(checkpointer)),
        })
    }

    /// Process-unique client identifier; a rebuilt client always gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Store target identifier this client is bound to.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Connection pool for store operations.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn checkpointer_stopped(&self) -> bool {
        self.checkpointer.lock().is_none()
    }

    /// Stop the checkpoint task and close the pool.
    ///
    /// Best-effort: failures and timeouts are logged, never returned.
    pub(crate) async fn close(&self, limit: Duration) {
        let checkpointer = self.checkpointer.lock().take();
        if let Some(mut checkpointer) = checkpointer {
            checkpointer.stop(self.id).await;
        }

        if tokio::time::timeout(limit, self.pool.close()).await.is_err() {
            tracing::warn!(
                client_id = self.id,
                timeout = ?limit,
                "Timed out draining connections while closing client"
            );
        }
        tracing::info!(client_id = self.id, project = %self.project, "Client closed");
    }
}

/// Background WAL checkpoint task owned by a client.
///
/// Cancelled on drop, so a client dropped without `close` does not leave the
/// task running.
struct Checkpointer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Checkpointer {
    fn spawn(client_id: u64, pool: SqlitePool, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_CHECKPOINT_INTERVAL));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.checkpoint().await {
                            tracing::warn!(client_id, error = %e, "Periodic checkpoint failed");
                        }
                    }
                }
            }
            tracing::debug!(client_id, "Checkpoint task stopped");
        });
        Self { cancel, task }
    }

    async fn stop(&mut self, client_id: u64) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await
            && !e.is_cancelled()
        {
            tracing::warn!(client_id, error = %e, "Checkpoint task ended abnormally");
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Slot
// =============================================================================

/// Cached client plus its lifecycle state.
pub(crate) struct Slot<T> {
    state: ClientState,
    client: Option<Arc<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: ClientState::Uninitialized,
            client: None,
        }
    }
}

impl<T> Slot<T> {
    pub(crate) fn state(&self) -> ClientState {
        self.state
    }

    /// The cached client, if ready and still open.
    pub(crate) fn ready(&self, is_closed: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        match (&self.state, &self.client) {
            (ClientState::Ready, Some(client)) if !is_closed(client) => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Remove a cached client that is no longer usable.
    pub(crate) fn take_stale(&mut self, is_closed: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        match &self.client {
            Some(client) if is_closed(client) => {
                self.state = ClientState::Uninitialized;
                self.client.take()
            }
            _ => None,
        }
    }

    pub(crate) fn begin_init(&mut self) {
        self.state = ClientState::Initializing;
        self.client = None;
    }

    pub(crate) fn finish_init(&mut self, client: Arc<T>) {
        self.state = ClientState::Ready;
        self.client = Some(client);
    }

    pub(crate) fn abort_init(&mut self) {
        self.state = ClientState::Uninitialized;
        self.client = None;
    }

    /// Move to `Closing`, keeping the client reachable for the close itself.
    pub(crate) fn begin_close(&mut self) -> Option<Arc<T>> {
        let client = self.client.clone()?;
        self.state = ClientState::Closing;
        Some(client)
    }

    pub(crate) fn finish_close(&mut self) {
        self.state = ClientState::Uninitialized;
        self.client = None;
    }
}

/// Holds a slot in `Initializing`; resets it to `Uninitialized` unless completed.
///
/// Dropping the guard (error, timeout, or a cancelled acquire future) never
/// leaves a half-built client behind.
pub(crate) struct InitGuard<'a, T> {
    slot: &'a RwLock<Slot<T>>,
    done: bool,
}

impl<'a, T> InitGuard<'a, T> {
    pub(crate) fn begin(slot: &'a RwLock<Slot<T>>) -> Self {
        slot.write().begin_init();
        Self { slot, done: false }
    }

    pub(crate) fn complete(mut self, client: Arc<T>) {
        self.slot.write().finish_init(client);
        self.done = true;
    }
}

impl<T> Drop for InitGuard<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.slot.write().abort_init();
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Lazily constructs, shares and releases the async [`Client`].
pub struct ClientManager {
    config: StoreConfig,
    connector: Arc<dyn Connector>,
    slot: RwLock<Slot<Client>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientManager {
    /// Create a manager using the default SQLite connector.
    ///
    /// Nothing is validated or opened until the first acquire.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_connector(config, Arc::new(SqliteConnector))
    }

    /// Create a manager with a custom connector.
    pub fn with_connector(config: StoreConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            slot: RwLock::new(Slot::default()),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store configuration this manager was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.slot.read().state()
    }

    /// Return the shared client, constructing it if absent.
    ///
    /// Bounded by `store.connect_timeout`.
    ///
    /// # Errors
    /// - `StoreError::Configuration` if the store target is not configured
    /// - `StoreError::Timeout` if construction exceeds the connect timeout
    /// - `StoreError::Transport` if the connection cannot be opened
    pub async fn acquire(&self) -> Result<ClientHandle, StoreError> {
        if let Some(client) = self.slot.read().ready(Client::is_closed) {
            return Ok(client);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(client) = self.slot.read().ready(Client::is_closed) {
            tracing::debug!(client_id = client.id(), "Client initialized by a concurrent caller");
            return Ok(client);
        }

        let stale = self.slot.write().take_stale(Client::is_closed);
        if let Some(stale) = stale {
            tracing::debug!(client_id = stale.id(), "Replacing client with a closed transport");
            stale.close(self.config.connect_timeout).await;
        }

        let target = self.config.target()?;
        let init = InitGuard::begin(&self.slot);
        tracing::debug!(project = %target.project, url = %target.url, "Initializing client");

        let limit = self.config.connect_timeout;
        match bounded(limit, Client::connect(self.connector.as_ref(), &target)).await {
            Ok(client) => {
                let client = Arc::new(client);
                init.complete(Arc::clone(&client));
                tracing::info!(client_id = client.id(), project = %target.project, "Client ready");
                Ok(client)
            }
            Err(e) => {
                drop(init);
                tracing::warn!(project = %target.project, error = %e, "Client initialization failed");
                Err(e)
            }
        }
    }

    /// Close and forget the cached client.
    ///
    /// Transport close failures are logged and swallowed. The slot is cleared
    /// last, so any acquire that observes `Uninitialized` builds a new client.
    pub async fn release(&self) {
        let _guard = self.init_lock.lock().await;
        let Some(client) = self.slot.write().begin_close() else {
            return;
        };
        tracing::debug!(client_id = client.id(), "Releasing client");

        client.close(self.config.connect_timeout).await;
        self.slot.write().finish_close();
    }
}
