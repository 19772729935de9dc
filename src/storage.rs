//! Storage Layer
//!
//! Deduplicating persistence for hazard events on an embedded SQLite store:
//! - **Clients**: one lazily built, shared client per target, released on demand
//! - **Writes**: last-write-wins by `updated_at` with a one-second tolerance
//! - **Reads**: filtered, most-recent-first listings streamed lazily
//!
//! # Components
//!
//! - [`ClientManager`] / [`BlockingClientManager`]: client lifecycle (async / blocking)
//! - [`EventRepository`] / [`BlockingEventRepository`]: deduplicating writes
//! - [`EventQueryEngine`] / [`BlockingEventQueryEngine`]: lookups and listings
//! - [`db`]: connection pool wrapper and the [`Connector`] seam

mod blocking;
mod client;
pub mod db;
mod error;
mod query;
mod repository;
mod schema;
mod types;

pub use blocking::{
    BlockingClient, BlockingClientHandle, BlockingClientManager, BlockingEventIter,
    BlockingEventQueryEngine, BlockingEventRepository,
};
pub use client::{Client, ClientHandle, ClientManager};
pub use db::{Connector, SqliteConnector, SqlitePool, StoreTarget};
pub use error::StoreError;
pub use query::{EventQueryEngine, EventStream};
pub use repository::{EventRepository, TOLERANCE, supersedes};
pub use types::{Area, ClientState, Event, EventFilter, MAX_LIMIT, SaveOutcome, WriteMode};
