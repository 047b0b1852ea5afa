//! Node entities and their metrics.
//!
//! A [`Node`] is the versioned record for one physical site in the twin.
//! Its [`NodeMetrics`] are owned exclusively by the node and are always
//! replaced as a whole unit -- fields are never merged across sources.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{NodeStatus, NodeType};
use crate::ids::NodeId;

/// Errors raised by node invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// A node may not list itself among its connections.
    #[error("node {0} cannot connect to itself")]
    SelfLoop(NodeId),

    /// The version counter cannot be advanced any further.
    #[error("node {0} version counter exhausted")]
    VersionOverflow(NodeId),
}

/// Latest known operating metrics of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NodeMetrics {
    /// Units currently on hand.
    pub current_inventory: u64,
    /// Fraction of capacity in use, 0.0 to 1.0.
    pub utilization_rate: f64,
    /// When the source system observed these metrics.
    pub last_update_timestamp: DateTime<Utc>,
    /// Identifier of the system that reported these metrics.
    pub last_update_source: String,
}

impl NodeMetrics {
    /// Create a new metrics unit.
    pub fn new(
        current_inventory: u64,
        utilization_rate: f64,
        last_update_timestamp: DateTime<Utc>,
        last_update_source: impl Into<String>,
    ) -> Self {
        Self {
            current_inventory,
            utilization_rate,
            last_update_timestamp,
            last_update_source: last_update_source.into(),
        }
    }
}

/// A versioned record representing one physical entity in the twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Node {
    /// Stable identity.
    pub node_id: NodeId,
    /// Role in the supply chain.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Site descriptor (address, facility code, or region).
    pub location: String,
    /// Maximum units the node can hold or process.
    pub capacity: u64,
    /// Operational health.
    pub status: NodeStatus,
    /// Downstream nodes this node ships to. Never contains `node_id`.
    pub connections: BTreeSet<NodeId>,
    /// Latest accepted metrics.
    pub metrics: NodeMetrics,
    /// Optimistic-concurrency version, starting at 1.
    pub version: u64,
    /// When the node was provisioned.
    pub created_at: DateTime<Utc>,
    /// When the node last accepted an update.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a freshly provisioned node at version 1.
    pub fn new(
        node_id: NodeId,
        node_type: NodeType,
        location: impl Into<String>,
        capacity: u64,
        metrics: NodeMetrics,
    ) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            node_type,
            location: location.into(),
            capacity,
            status: NodeStatus::Operational,
            connections: BTreeSet::new(),
            metrics,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a connection to another node.
    ///
    /// Returns `true` if the connection was new.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SelfLoop`] if `other` is this node.
    pub fn connect(&mut self, other: NodeId) -> Result<bool, NodeError> {
        if other == self.node_id {
            return Err(NodeError::SelfLoop(other));
        }
        Ok(self.connections.insert(other))
    }

    /// Builder-style variant of [`Node::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SelfLoop`] if `other` is this node.
    pub fn with_connection(mut self, other: NodeId) -> Result<Self, NodeError> {
        self.connect(other)?;
        Ok(self)
    }

    /// Set the operational status.
    #[must_use]
    pub const fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Produce the successor of this node after an accepted metrics update.
    ///
    /// The metrics are replaced wholesale, the version advances by exactly
    /// one and `updated_at` is set to `at`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::VersionOverflow`] if the version is `u64::MAX`.
    pub fn advanced(&self, metrics: NodeMetrics, at: DateTime<Utc>) -> Result<Self, NodeError> {
        let version = self
            .version
            .checked_add(1)
            .ok_or_else(|| NodeError::VersionOverflow(self.node_id.clone()))?;
        Ok(Self {
            metrics,
            version,
            updated_at: at,
            ..self.clone()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample() -> Node {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Node::new(
            NodeId::new("wh-1").unwrap(),
            NodeType::Warehouse,
            "Rotterdam",
            10_000,
            NodeMetrics::new(500, 0.5, ts, "iot-core"),
        )
    }

    #[test]
    fn new_node_starts_at_version_one() {
        let node = sample();
        assert_eq!(node.version, 1);
        assert_eq!(node.status, NodeStatus::Operational);
        assert!(node.connections.is_empty());
    }

    #[test]
    fn self_loop_is_rejected() {
        let mut node = sample();
        let own = node.node_id.clone();
        assert_eq!(node.connect(own.clone()), Err(NodeError::SelfLoop(own)));
        assert!(node.connect(NodeId::new("dc-2").unwrap()).unwrap());
        assert!(!node.connect(NodeId::new("dc-2").unwrap()).unwrap());
    }

    #[test]
    fn advanced_replaces_metrics_and_bumps_version() {
        let node = sample();
        let later = node.metrics.last_update_timestamp + chrono::Duration::seconds(3);
        let metrics = NodeMetrics::new(480, 0.48, later, "manual-entry");
        let next = node.advanced(metrics.clone(), later).unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.metrics, metrics);
        assert_eq!(next.updated_at, later);
        assert_eq!(next.created_at, node.created_at);
    }

    #[test]
    fn advanced_refuses_to_wrap() {
        let mut node = sample();
        node.version = u64::MAX;
        let metrics = node.metrics.clone();
        assert!(matches!(
            node.advanced(metrics, Utc::now()),
            Err(NodeError::VersionOverflow(_))
        ));
    }

    #[test]
    fn serializes_type_field_in_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "warehouse");
        assert_eq!(json["metrics"]["lastUpdateSource"], "iot-core");
        assert_eq!(json["nodeId"], "wh-1");
    }
}
