//! Ingestion core for the supply-chain digital twin.
//!
//! This crate turns raw telemetry and ERP events into versioned node
//! updates. It validates each event, merges it with the node's current
//! metrics, writes it under optimistic concurrency, and reports every fault
//! exactly once.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `chaintwin.yaml` plus
//!   environment overrides.
//! - [`conflict`] -- [`ConflictResolver`] and the pluggable
//!   [`ResolutionPolicy`].
//! - [`gateway`] -- [`IngestionGateway`], the validate/merge/write pipeline.
//! - [`reporter`] -- [`ErrorReporter`], alert severities, and alert channels.
//! - [`retry`] -- Bounded exponential backoff for store calls.

pub mod config;
pub mod conflict;
pub mod gateway;
pub mod reporter;
pub mod retry;

pub use config::{ConfigError, TwinConfig};
pub use conflict::{ConflictResolver, Discrepancy, MergeOutcome, ResolutionPolicy, Winner};
pub use gateway::{AcceptedUpdate, GatewaySettings, IngestError, IngestionGateway};
pub use reporter::{
    Alert, AlertChannel, AlertSeverity, AlertStore, ErrorReporter, FailureReport, Resolution,
    SharedAlertStore,
};
pub use retry::{RetryPolicy, Tally};
