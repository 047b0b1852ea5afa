//! Enumeration types for supply-chain nodes and the failure taxonomy.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The role a node plays in the physical supply chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum NodeType {
    /// Raw material or component supplier.
    Supplier,
    /// Manufacturing or assembly plant.
    Manufacturer,
    /// Storage facility.
    Warehouse,
    /// Regional distribution hub.
    Distributor,
    /// Point of sale.
    Retailer,
}

impl NodeType {
    /// Lowercase name as stored in the durable store.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Supplier => "supplier",
            Self::Manufacturer => "manufacturer",
            Self::Warehouse => "warehouse",
            Self::Distributor => "distributor",
            Self::Retailer => "retailer",
        }
    }

    /// Parse the lowercase stored name back into a [`NodeType`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "supplier" => Some(Self::Supplier),
            "manufacturer" => Some(Self::Manufacturer),
            "warehouse" => Some(Self::Warehouse),
            "distributor" => Some(Self::Distributor),
            "retailer" => Some(Self::Retailer),
            _ => None,
        }
    }
}

/// Operational health of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum NodeStatus {
    /// Running normally.
    Operational,
    /// Running at reduced capacity.
    Degraded,
    /// Flows through the node are interrupted.
    Disrupted,
    /// Not reporting at all.
    Offline,
}

impl NodeStatus {
    /// Lowercase name as stored in the durable store.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Degraded => "degraded",
            Self::Disrupted => "disrupted",
            Self::Offline => "offline",
        }
    }

    /// Parse the lowercase stored name back into a [`NodeStatus`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "operational" => Some(Self::Operational),
            "degraded" => Some(Self::Degraded),
            "disrupted" => Some(Self::Disrupted),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Classification of every failure the twin core can surface.
///
/// Transient kinds are retried where they are detected; permanent kinds are
/// rejected back to the event source immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum ErrorKind {
    /// Malformed or incomplete input.
    #[serde(rename = "ValidationError")]
    Validation,
    /// The referenced node is not part of the twin.
    #[serde(rename = "NotFoundError")]
    NotFound,
    /// Optimistic-concurrency version mismatch.
    #[serde(rename = "ConcurrencyError")]
    Concurrency,
    /// Cache or durable store unreachable or timed out.
    #[serde(rename = "ConnectivityError")]
    Connectivity,
}

impl ErrorKind {
    /// Name used in logs, alerts, and rejection replies.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::NotFound => "NotFoundError",
            Self::Concurrency => "ConcurrencyError",
            Self::Connectivity => "ConnectivityError",
        }
    }

    /// Whether failures of this kind are retried locally before surfacing.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Concurrency | Self::Connectivity)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
