//! Ingestion service for the supply-chain digital twin.
//!
//! Two surfaces share one set of store handles:
//!
//! - [`intake`] -- the NATS subscription that feeds raw events through the
//!   [`IngestionGateway`](chaintwin_core::IngestionGateway).
//! - [`router`] / [`server`] -- a read-only HTTP API over nodes, cached
//!   simulations, twin snapshots, and recent alerts.

#![recursion_limit = "256"]

pub mod error;
pub mod handlers;
pub mod intake;
pub mod router;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use intake::{IngestReply, IntakeError, run_intake};
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
