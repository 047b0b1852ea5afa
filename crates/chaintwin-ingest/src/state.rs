//! Shared state for the read API handlers.

use chaintwin_core::SharedAlertStore;
use chaintwin_db::{CacheLayer, NodeRepository};

/// Handles the read API needs, cloned into every request.
#[derive(Clone)]
pub struct AppState {
    /// Node reads go through the repository's read-through cache.
    pub repository: NodeRepository,
    /// Derived data: simulations and twin snapshots.
    pub cache: CacheLayer,
    /// Recent alerts, when the in-memory alert channel is active.
    pub alerts: Option<SharedAlertStore>,
}

impl AppState {
    /// Bundle the handles.
    pub const fn new(
        repository: NodeRepository,
        cache: CacheLayer,
        alerts: Option<SharedAlertStore>,
    ) -> Self {
        Self {
            repository,
            cache,
            alerts,
        }
    }
}
