//! Durable storage for node records.
//!
//! Every metrics write is conditioned on the version the writer last read.
//! In `PostgreSQL` the condition lives in the `WHERE` clause of a single
//! `UPDATE ... RETURNING`, so the compare and the increment are one atomic
//! statement and no row lock is held across round-trips.
//!
//! See `migrations/` for the `nodes` table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chaintwin_types::{Node, NodeId, NodeMetrics, NodeStatus, NodeType};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::DbError;
use crate::postgres::PostgresPool;

const NODE_COLUMNS: &str = "node_id, node_type, location, capacity, status, connections, \
                            metrics, version, created_at, updated_at";

/// Durable store behind a [`NodeRepository`](crate::repository::NodeRepository).
#[derive(Clone)]
pub enum NodeStore {
    /// The `nodes` table in `PostgreSQL`.
    Postgres(PostgresPool),
    /// An in-process map, for tests and single-node development.
    InMemory(InMemoryNodeStore),
}

impl NodeStore {
    /// Read a node by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the store cannot be queried, or
    /// [`DbError::Decode`] if the stored row is unreadable.
    pub async fn fetch(&self, node_id: &NodeId) -> Result<Option<Node>, DbError> {
        match self {
            Self::Postgres(pg) => fetch_pg(pg, node_id).await,
            Self::InMemory(mem) => mem.fetch(node_id).await,
        }
    }

    /// Provision a new node.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DuplicateNode`] if the id is already taken.
    pub async fn insert(&self, node: &Node) -> Result<Node, DbError> {
        match self {
            Self::Postgres(pg) => insert_pg(pg, node).await,
            Self::InMemory(mem) => mem.insert(node).await,
        }
    }

    /// Replace a node's metrics if its stored version equals `expected_version`.
    ///
    /// On success the version is incremented by exactly one and `updated_at`
    /// is set to the store's clock.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::VersionConflict`] on a version mismatch (nothing is
    /// written), or [`DbError::NodeNotFound`] if the node does not exist.
    pub async fn update_metrics(
        &self,
        node_id: &NodeId,
        metrics: &NodeMetrics,
        expected_version: u64,
    ) -> Result<Node, DbError> {
        match self {
            Self::Postgres(pg) => update_pg(pg, node_id, metrics, expected_version).await,
            Self::InMemory(mem) => mem.update_metrics(node_id, metrics, expected_version).await,
        }
    }
}

// =========================================================================
// PostgreSQL
// =========================================================================

/// A row from the `nodes` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRow {
    /// Node identifier.
    pub node_id: String,
    /// Lowercase node type.
    pub node_type: String,
    /// Site descriptor.
    pub location: String,
    /// Capacity in units.
    pub capacity: i64,
    /// Lowercase status.
    pub status: String,
    /// JSON array of connected node ids.
    pub connections: serde_json::Value,
    /// JSON metrics unit.
    pub metrics: serde_json::Value,
    /// Optimistic-concurrency version.
    pub version: i64,
    /// Provisioning time.
    pub created_at: DateTime<Utc>,
    /// Last accepted update.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<NodeRow> for Node {
    type Error = DbError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let node_id = NodeId::new(row.node_id)
            .map_err(|e| DbError::Decode(format!("node_id: {e}")))?;
        let node_type = NodeType::parse(&row.node_type)
            .ok_or_else(|| DbError::Decode(format!("unknown node_type {:?}", row.node_type)))?;
        let status = NodeStatus::parse(&row.status)
            .ok_or_else(|| DbError::Decode(format!("unknown status {:?}", row.status)))?;
        let connections: BTreeSet<NodeId> = serde_json::from_value(row.connections)
            .map_err(|e| DbError::Decode(format!("connections: {e}")))?;
        let metrics: NodeMetrics = serde_json::from_value(row.metrics)
            .map_err(|e| DbError::Decode(format!("metrics: {e}")))?;
        let capacity = u64::try_from(row.capacity)
            .map_err(|e| DbError::Decode(format!("capacity: {e}")))?;
        let version = u64::try_from(row.version)
            .map_err(|e| DbError::Decode(format!("version: {e}")))?;

        Ok(Self {
            node_id,
            node_type,
            location: row.location,
            capacity,
            status,
            connections,
            metrics,
            version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|e| DbError::Decode(format!("{field} out of range: {e}")))
}

async fn fetch_pg(pg: &PostgresPool, node_id: &NodeId) -> Result<Option<Node>, DbError> {
    let row = sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = $1"
    ))
    .bind(node_id.as_str())
    .fetch_optional(pg.pool())
    .await
    .map_err(|e| DbError::postgres("node fetch", &e))?;

    row.map(Node::try_from).transpose()
}

async fn insert_pg(pg: &PostgresPool, node: &Node) -> Result<Node, DbError> {
    let connections = serde_json::to_value(&node.connections)?;
    let metrics = serde_json::to_value(&node.metrics)?;

    let row = sqlx::query_as::<_, NodeRow>(&format!(
        r"INSERT INTO nodes
          (node_id, node_type, location, capacity, status, connections, metrics, version, created_at, updated_at)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
          ON CONFLICT (node_id) DO NOTHING
          RETURNING {NODE_COLUMNS}"
    ))
    .bind(node.node_id.as_str())
    .bind(node.node_type.as_str())
    .bind(&node.location)
    .bind(to_i64(node.capacity, "capacity")?)
    .bind(node.status.as_str())
    .bind(&connections)
    .bind(&metrics)
    .bind(to_i64(node.version, "version")?)
    .bind(node.created_at)
    .bind(node.updated_at)
    .fetch_optional(pg.pool())
    .await
    .map_err(|e| DbError::postgres("node insert", &e))?;

    let row = row.ok_or_else(|| DbError::DuplicateNode(node.node_id.clone()))?;
    tracing::debug!(node_id = %node.node_id, "Inserted node");
    Node::try_from(row)
}

async fn update_pg(
    pg: &PostgresPool,
    node_id: &NodeId,
    metrics: &NodeMetrics,
    expected_version: u64,
) -> Result<Node, DbError> {
    let metrics_json = serde_json::to_value(metrics)?;

    let row = sqlx::query_as::<_, NodeRow>(&format!(
        r"UPDATE nodes
          SET metrics = $3, version = version + 1, updated_at = now()
          WHERE node_id = $1 AND version = $2
          RETURNING {NODE_COLUMNS}"
    ))
    .bind(node_id.as_str())
    .bind(to_i64(expected_version, "expected_version")?)
    .bind(&metrics_json)
    .fetch_optional(pg.pool())
    .await
    .map_err(|e| DbError::postgres("node update", &e))?;

    if let Some(row) = row {
        return Node::try_from(row);
    }

    // Nothing matched: either the node is missing or another writer won.
    let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM nodes WHERE node_id = $1")
        .bind(node_id.as_str())
        .fetch_optional(pg.pool())
        .await
        .map_err(|e| DbError::postgres("node version check", &e))?;

    match actual {
        None => Err(DbError::NodeNotFound(node_id.clone())),
        Some(actual) => Err(DbError::VersionConflict {
            node_id: node_id.clone(),
            expected: expected_version,
            actual: u64::try_from(actual).map_err(|e| DbError::Decode(format!("version: {e}")))?,
        }),
    }
}

// =========================================================================
// In-memory
// =========================================================================

#[derive(Debug, Default)]
struct Counters {
    fetches: AtomicUsize,
    updates: AtomicUsize,
    outage: AtomicUsize,
    contention: AtomicUsize,
    lost_acks: AtomicUsize,
}

/// In-process node store.
///
/// Besides holding nodes, it counts calls and can simulate an unreachable,
/// slow, or contended store, which is how the retry and timeout paths are
/// exercised in tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNodeStore {
    nodes: Arc<Mutex<BTreeMap<NodeId, Node>>>,
    counters: Arc<Counters>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryNodeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `fetch` calls served (including failed ones).
    pub fn fetch_count(&self) -> usize {
        self.counters.fetches.load(Ordering::SeqCst)
    }

    /// Number of `update_metrics` calls served (including failed ones).
    pub fn update_count(&self) -> usize {
        self.counters.updates.load(Ordering::SeqCst)
    }

    /// Make the next `calls` operations fail with [`DbError::Connectivity`].
    pub fn fail_next(&self, calls: usize) {
        self.counters.outage.store(calls, Ordering::SeqCst);
    }

    /// Make the next `updates` metric writes lose a race: just before each
    /// one is checked, another writer commits and advances the version.
    pub fn simulate_contention(&self, updates: usize) {
        self.counters.contention.store(updates, Ordering::SeqCst);
    }

    /// Make the next `updates` metric writes commit and then fail with
    /// [`DbError::Connectivity`], as if the acknowledgement was lost.
    pub fn fail_after_commit(&self, updates: usize) {
        self.counters.lost_acks.store(updates, Ordering::SeqCst);
    }

    /// Delay every operation by `latency` before it touches the map.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().await = latency;
    }

    async fn io(&self, operation: &'static str) -> Result<(), DbError> {
        let latency = *self.latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .counters
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DbError::Connectivity {
                operation,
                message: String::from("simulated outage"),
            });
        }
        Ok(())
    }

    async fn fetch(&self, node_id: &NodeId) -> Result<Option<Node>, DbError> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        self.io("node fetch").await?;
        Ok(self.nodes.lock().await.get(node_id).cloned())
    }

    async fn insert(&self, node: &Node) -> Result<Node, DbError> {
        self.io("node insert").await?;
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(&node.node_id) {
            return Err(DbError::DuplicateNode(node.node_id.clone()));
        }
        nodes.insert(node.node_id.clone(), node.clone());
        Ok(node.clone())
    }

    async fn update_metrics(
        &self,
        node_id: &NodeId,
        metrics: &NodeMetrics,
        expected_version: u64,
    ) -> Result<Node, DbError> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        self.io("node update").await?;

        let contended = self
            .counters
            .contention
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut nodes = self.nodes.lock().await;
        let mut current = nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| DbError::NodeNotFound(node_id.clone()))?;
        if contended {
            let rival = current.metrics.clone();
            current = current
                .advanced(rival, Utc::now())
                .map_err(|e| DbError::Decode(e.to_string()))?;
            nodes.insert(node_id.clone(), current.clone());
        }
        if current.version != expected_version {
            return Err(DbError::VersionConflict {
                node_id: node_id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        let next = current
            .advanced(metrics.clone(), Utc::now())
            .map_err(|e| DbError::Decode(e.to_string()))?;
        nodes.insert(node_id.clone(), next.clone());

        let ack_lost = self
            .counters
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if ack_lost {
            return Err(DbError::Connectivity {
                operation: "node update",
                message: String::from("simulated lost acknowledgement"),
            });
        }
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row() -> NodeRow {
        NodeRow {
            node_id: String::from("wh-1"),
            node_type: String::from("warehouse"),
            location: String::from("Rotterdam"),
            capacity: 10_000,
            status: String::from("degraded"),
            connections: json!(["dc-2"]),
            metrics: json!({
                "currentInventory": 500,
                "utilizationRate": 0.5,
                "lastUpdateTimestamp": "2026-03-01T12:00:00Z",
                "lastUpdateSource": "iot-core"
            }),
            version: 4,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn row_decodes_into_node() {
        let node = Node::try_from(row()).unwrap();
        assert_eq!(node.status, NodeStatus::Degraded);
        assert_eq!(node.version, 4);
        assert!(node.connections.contains(&NodeId::new("dc-2").unwrap()));
        assert_eq!(node.metrics.last_update_source, "iot-core");
    }

    #[test]
    fn unreadable_rows_are_decode_errors() {
        let mut bad = row();
        bad.node_type = String::from("factory");
        assert!(matches!(Node::try_from(bad), Err(DbError::Decode(_))));

        let mut bad = row();
        bad.version = -1;
        assert!(matches!(Node::try_from(bad), Err(DbError::Decode(_))));
    }

    #[tokio::test]
    async fn simulated_outage_consumes_calls() {
        let store = InMemoryNodeStore::new();
        store.fail_next(1);
        let id = NodeId::new("n1").unwrap();
        assert!(store.fetch(&id).await.unwrap_err().is_transient());
        assert!(store.fetch(&id).await.unwrap().is_none());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn lost_acknowledgement_still_commits() {
        let store = InMemoryNodeStore::new();
        let id = NodeId::new("n1").unwrap();
        let created = store
            .insert(&Node::new(
                id.clone(),
                NodeType::Warehouse,
                "Rotterdam",
                1_000,
                NodeMetrics::new(10, 0.01, Utc::now(), "erp"),
            ))
            .await
            .unwrap();

        store.fail_after_commit(1);
        let metrics = NodeMetrics::new(20, 0.02, Utc::now(), "iot");
        let err = store
            .update_metrics(&id, &metrics, created.version)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let stored = store.fetch(&id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.metrics, metrics);
    }
}
