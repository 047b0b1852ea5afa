//! Shared type definitions for the supply-chain digital twin.
//!
//! This crate is the single source of truth for the types that cross crate
//! boundaries: the durable [`Node`] record, the derived-data cache entries,
//! and the ingestion event decoder. Types consumed by the dashboard export
//! `TypeScript` bindings via `ts-rs`.
//!
//! # Modules
//!
//! - [`ids`] -- Non-empty node identifier
//! - [`enums`] -- Node type, status, and failure kinds
//! - [`node`] -- Node entity and its metrics unit
//! - [`cache`] -- Simulation, session, and twin-snapshot cache entries
//! - [`event`] -- Raw and validated ingestion events

pub mod cache;
pub mod enums;
pub mod event;
pub mod ids;
pub mod node;

pub use cache::{DigitalTwinSnapshot, SessionCacheEntry, SimulationCacheEntry};
pub use enums::{ErrorKind, NodeStatus, NodeType};
pub use event::{IngestEvent, MetricsUpdate, RawEvent, RawMetrics, ValidationError};
pub use ids::{EmptyNodeId, NodeId};
pub use node::{Node, NodeError, NodeMetrics};
