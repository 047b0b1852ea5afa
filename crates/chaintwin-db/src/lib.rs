//! Data layer for the supply-chain digital twin (`Dragonfly` + `PostgreSQL`).
//!
//! `PostgreSQL` holds the versioned node records and is the only source of
//! truth. `Dragonfly` holds time-bounded derived data: read-through node
//! copies, simulation results, sessions, and twin snapshots.
//!
//! # Architecture
//!
//! ```text
//! IngestionGateway
//!     |
//!     +-- NodeRepository ----+-- CacheLayer (node:{id}, short TTL)
//!     |                      +-- NodeStore  (conditional UPDATE ... RETURNING)
//!     |
//! Read API -- CacheLayer (simulation:*, session:*, twin:snapshot:*)
//! ```
//!
//! Both stores have in-memory stand-ins selected through enum variants
//! ([`CacheBackend::InMemory`], [`NodeStore::InMemory`]), so the whole
//! pipeline runs in tests without live services.
//!
//! # Modules
//!
//! - [`cache`] -- `CacheLayer` and its domain helpers
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) backend
//! - [`memory`] -- in-process cache backend with simulated-clock expiry
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`node_store`] -- durable node storage
//! - [`repository`] -- `NodeRepository` with optimistic concurrency
//! - [`error`] -- Shared error types

pub mod cache;
pub mod dragonfly;
pub mod error;
pub mod memory;
pub mod node_store;
pub mod postgres;
pub mod repository;

// Re-export primary types for convenience.
pub use cache::{
    CacheBackend, CacheLayer, DEFAULT_CACHE_TIMEOUT, SESSION_TTL, SIMULATION_TTL, SNAPSHOT_TTL,
    node_key,
};
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use memory::InMemoryCache;
pub use node_store::{InMemoryNodeStore, NodeRow, NodeStore};
pub use postgres::PostgresPool;
pub use repository::{DEFAULT_NODE_TTL, DEFAULT_STORE_TIMEOUT, NodeRepository};
