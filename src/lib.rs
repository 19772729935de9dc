//! Hazard Store - deduplicating event persistence for alert feeds
//!
//! This crate stores hazard and weather alert events pulled from upstream
//! feeds. Feeds re-deliver the same alert many times; an event is only
//! rewritten when its `updated_at` is more than one second newer than the
//! stored record. It can be used as a library, or run as the standalone
//! `hazard-store` binary.
//!
//! # Architecture
//!
//! - **Config**: YAML configuration with env-var expansion
//! - **Storage**: client lifecycle, write path and read path over SQLite
//! - **Ingest**: JSON-lines feed ingestion with retry and backoff
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hazard_store::{
//!     ClientManager, EventFilter, EventQueryEngine, EventRepository, StoreConfig,
//! };
//!
//! # async fn run(event: hazard_store::Event) -> Result<(), hazard_store::StoreError> {
//! let clients = Arc::new(ClientManager::new(StoreConfig {
//!     project: Some("alerts".to_string()),
//!     ..StoreConfig::default()
//! }));
//!
//! let outcome = EventRepository::new(Arc::clone(&clients)).save(&event).await;
//! println!("save: {}", outcome.kind());
//!
//! let recent = EventQueryEngine::new(Arc::clone(&clients))
//!     .list(EventFilter::new(20).area_codes(["130000"]))
//!     .await?
//!     .try_collect_vec()
//!     .await?;
//! println!("{} recent events", recent.len());
//!
//! clients.release().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ingest;
pub mod storage;

pub use config::{AppConfig, ConfigError, IngestConfig, StoreConfig};
pub use ingest::{IngestSummary, ingest};
pub use storage::{
    Area, BlockingClient, BlockingClientHandle, BlockingClientManager, BlockingEventIter,
    BlockingEventQueryEngine, BlockingEventRepository, Client, ClientHandle, ClientManager,
    ClientState, Connector, Event, EventFilter, EventQueryEngine, EventRepository, EventStream,
    MAX_LIMIT, SaveOutcome, SqliteConnector, SqlitePool, StoreError, StoreTarget, TOLERANCE,
    WriteMode, supersedes,
};
