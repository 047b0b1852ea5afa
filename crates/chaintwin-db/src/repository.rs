//! Versioned node repository with a read-through cache.
//!
//! The durable [`NodeStore`] is the only source of truth. Cached copies under
//! `node:{id}` live for a short TTL and are deleted after every accepted
//! write, so a reader sees at worst one TTL of staleness and a writer never
//! trusts the cache: a stale cached version only costs one version conflict,
//! after which the writer re-reads with [`NodeRepository::get_node_fresh`].
//!
//! The cache is advisory. Its failures are logged and the call falls
//! through to the store; only store failures reach the caller.

use std::time::Duration;

use chaintwin_types::{Node, NodeId, NodeMetrics};

use crate::cache::{CacheLayer, node_key};
use crate::error::{DbError, bounded};
use crate::node_store::NodeStore;

/// Default lifetime of a cached node.
pub const DEFAULT_NODE_TTL: Duration = Duration::from_secs(60);

/// Default timeout for a single durable-store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Node storage with optimistic concurrency.
#[derive(Clone)]
pub struct NodeRepository {
    store: NodeStore,
    cache: CacheLayer,
    timeout: Duration,
    node_ttl: Duration,
}

impl NodeRepository {
    /// Create a repository over `store`, caching in `cache`.
    pub const fn new(store: NodeStore, cache: CacheLayer) -> Self {
        Self {
            store,
            cache,
            timeout: DEFAULT_STORE_TIMEOUT,
            node_ttl: DEFAULT_NODE_TTL,
        }
    }

    /// Set the per-call store timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how long cached nodes live.
    #[must_use]
    pub const fn with_node_ttl(mut self, ttl: Duration) -> Self {
        self.node_ttl = ttl;
        self
    }

    /// The cache this repository reads through.
    pub const fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// The durable store.
    pub const fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Read a node, consulting the cache first.
    ///
    /// On a miss the node is read from the store and cached. An unknown node
    /// is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the store is unreachable or does
    /// not answer within the timeout.
    pub async fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>, DbError> {
        let key = node_key(node_id.as_str());
        match self.cache.get_json::<Node>(&key).await {
            Ok(Some(node)) => {
                tracing::trace!(node_id = %node_id, version = node.version, "Node cache hit");
                return Ok(Some(node));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "Node cache read failed, using store");
            }
        }
        self.get_node_fresh(node_id).await
    }

    /// Read a node straight from the store and refresh its cached copy.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the store is unreachable or does
    /// not answer within the timeout.
    pub async fn get_node_fresh(&self, node_id: &NodeId) -> Result<Option<Node>, DbError> {
        let node = bounded(self.timeout, "node fetch", self.store.fetch(node_id)).await?;
        if let Some(node) = &node {
            self.populate(node).await;
        }
        Ok(node)
    }

    /// Replace a node's metrics, conditioned on `expected_version`.
    ///
    /// On success the stored version is `expected_version + 1`, `updated_at`
    /// is the store's clock, and the cached copy is dropped.
    ///
    /// # Errors
    ///
    /// - [`DbError::VersionConflict`] if the stored version differs (nothing
    ///   is written)
    /// - [`DbError::NodeNotFound`] if the node does not exist
    /// - [`DbError::Connectivity`] if the store is unreachable or times out
    pub async fn update_node_metrics(
        &self,
        node_id: &NodeId,
        metrics: &NodeMetrics,
        expected_version: u64,
    ) -> Result<Node, DbError> {
        let node = bounded(
            self.timeout,
            "node update",
            self.store.update_metrics(node_id, metrics, expected_version),
        )
        .await?;

        self.invalidate(node_id).await;
        tracing::debug!(
            node_id = %node_id,
            version = node.version,
            source = %node.metrics.last_update_source,
            "Node metrics updated"
        );
        Ok(node)
    }

    /// Provision a new node.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateNode`] if the id is taken, or
    /// [`DbError::Connectivity`] if the store is unreachable.
    pub async fn create_node(&self, node: &Node) -> Result<Node, DbError> {
        let created = bounded(self.timeout, "node insert", self.store.insert(node)).await?;
        // Drop any leftover copy from a previous incarnation of this id.
        self.invalidate(&created.node_id).await;
        tracing::info!(node_id = %created.node_id, node_type = created.node_type.as_str(), "Node provisioned");
        Ok(created)
    }

    async fn populate(&self, node: &Node) {
        let key = node_key(node.node_id.as_str());
        if let Err(e) = self.cache.set_json(&key, node, Some(self.node_ttl)).await {
            tracing::warn!(node_id = %node.node_id, error = %e, "Failed to cache node");
        }
    }

    async fn invalidate(&self, node_id: &NodeId) {
        if let Err(e) = self.cache.delete(&node_key(node_id.as_str())).await {
            tracing::warn!(node_id = %node_id, error = %e, "Failed to invalidate cached node");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chaintwin_types::NodeType;
    use chrono::Utc;

    use super::*;
    use crate::node_store::InMemoryNodeStore;

    async fn fixture() -> (NodeRepository, InMemoryNodeStore, NodeId) {
        let store = InMemoryNodeStore::new();
        let cache = CacheLayer::in_memory();
        cache.connect().await.unwrap();
        let repo = NodeRepository::new(NodeStore::InMemory(store.clone()), cache);
        let id = NodeId::new("n1").unwrap();
        let node = Node::new(
            id.clone(),
            NodeType::Warehouse,
            "Rotterdam",
            1_000,
            NodeMetrics::new(500, 0.5, Utc::now(), "erp"),
        );
        repo.create_node(&node).await.unwrap();
        (repo, store, id)
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (repo, store, id) = fixture().await;
        assert!(repo.get_node(&id).await.unwrap().is_some());
        assert!(repo.get_node(&id).await.unwrap().is_some());
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn update_invalidates_cached_copy() {
        let (repo, store, id) = fixture().await;
        repo.get_node(&id).await.unwrap();
        let metrics = NodeMetrics::new(480, 0.48, Utc::now(), "manual-entry");
        let updated = repo.update_node_metrics(&id, &metrics, 1).await.unwrap();
        assert_eq!(updated.version, 2);

        let reread = repo.get_node(&id).await.unwrap().unwrap();
        assert_eq!(reread.version, 2);
        assert_eq!(reread.metrics.current_inventory, 480);
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn stale_version_writes_nothing() {
        let (repo, _store, id) = fixture().await;
        let metrics = NodeMetrics::new(1, 0.1, Utc::now(), "erp");
        let err = repo.update_node_metrics(&id, &metrics, 7).await.unwrap_err();
        assert!(matches!(err, DbError::VersionConflict { expected: 7, actual: 1, .. }));
        assert_eq!(repo.get_node_fresh(&id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn updating_a_missing_node_is_not_found() {
        let (repo, _store, _id) = fixture().await;
        let ghost = NodeId::new("ghost").unwrap();
        let metrics = NodeMetrics::new(1, 0.1, Utc::now(), "erp");
        let err = repo.update_node_metrics(&ghost, &metrics, 1).await.unwrap_err();
        assert!(matches!(err, DbError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn disconnected_cache_falls_through_to_store() {
        let (repo, store, id) = fixture().await;
        repo.cache().disconnect().await.unwrap();
        assert!(repo.get_node(&id).await.unwrap().is_some());
        assert!(repo.get_node(&id).await.unwrap().is_some());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_as_connectivity() {
        let (repo, store, id) = fixture().await;
        store.set_latency(Some(Duration::from_secs(30))).await;
        let err = repo.get_node_fresh(&id).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("node fetch"));
    }
}
