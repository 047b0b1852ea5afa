//! Value types stored in the derived-data cache.
//!
//! None of these carry authority over node state. They are produced by
//! external collaborators (simulation engine, session front-end, twin
//! exporter) and served back through the cache until they expire.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A cached simulation result for one scenario/parameter-hash pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SimulationCacheEntry {
    /// Scenario the result belongs to.
    pub scenario_id: String,
    /// Hash of the parameters the scenario was run with.
    pub result_hash: String,
    /// Opaque result payload.
    pub result: serde_json::Value,
    /// When the result was cached.
    pub timestamp: DateTime<Utc>,
}

/// A cached user session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct SessionCacheEntry {
    /// Session identifier.
    pub session_id: String,
    /// User owning the session.
    pub user_id: String,
    /// Free-form user preferences.
    pub preferences: serde_json::Value,
    /// Scenarios the user currently has open.
    pub active_scenarios: BTreeSet<String>,
    /// Last time the session saw activity.
    pub last_activity: DateTime<Utc>,
}

impl SessionCacheEntry {
    /// Create a session with no preferences and no open scenarios.
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            preferences: serde_json::Value::Object(serde_json::Map::new()),
            active_scenarios: BTreeSet::new(),
            last_activity: Utc::now(),
        }
    }
}

/// A point-in-time export of twin state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct DigitalTwinSnapshot {
    /// Instant the snapshot represents. Also its cache key.
    pub timestamp: DateTime<Utc>,
    /// Version label of the exporter that produced it.
    pub version: String,
    /// Opaque state blob.
    pub state: serde_json::Value,
}
