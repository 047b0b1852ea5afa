//! Type-safe identifier for supply-chain nodes.
//!
//! Node identifiers are assigned by the upstream systems that provision the
//! physical network (ERP exports, IoT registries), so they are opaque strings
//! rather than generated UUIDs. The only invariant enforced here is that an
//! identifier is never empty, including when it arrives through `serde`.

use serde::{Deserialize, Deserializer, Serialize};
use ts_rs::TS;

/// Error returned when constructing a [`NodeId`] from an empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("node id must not be empty")]
pub struct EmptyNodeId;

/// Unique identifier for a node in the digital twin.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier, rejecting empty or whitespace-only input.
    ///
    /// # Errors
    ///
    /// Returns [`EmptyNodeId`] if `id` has no non-whitespace characters.
    pub fn new(id: impl Into<String>) -> Result<Self, EmptyNodeId> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EmptyNodeId);
        }
        Ok(Self(id))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the inner [`String`].
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = EmptyNodeId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = EmptyNodeId;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}
