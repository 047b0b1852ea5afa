//! Time-bounded cache for derived data.
//!
//! [`CacheLayer`] is a generic TTL key-value store plus typed helpers for the
//! three kinds of derived data the twin serves: simulation results, user
//! sessions, and digital-twin snapshots. It is never a source of truth; node
//! state cached here is only an optimization in front of the durable store.
//!
//! # Key Patterns
//!
//! | Pattern | Type | TTL | Description |
//! |---------|------|-----|-------------|
//! | `node:{id}` | JSON | short (configurable) | Read-through copy of a [`Node`](chaintwin_types::Node) |
//! | `simulation:{scenario}:{hash}` | JSON | 3600 s | [`SimulationCacheEntry`] |
//! | `session:{id}` | JSON | 86400 s | [`SessionCacheEntry`] |
//! | `twin:snapshot:{timestamp}` | JSON | 300 s | [`DigitalTwinSnapshot`] |
//! | `twin:snapshot:latest` | String | 300 s | Timestamp of the newest snapshot |
//! | `twin:snapshot:index` | Set | 300 s after last write | Timestamps of snapshots still live |
//!
//! # Lifecycle
//!
//! A layer starts disconnected. [`CacheLayer::connect`] must succeed before
//! any operation; after [`CacheLayer::disconnect`] every operation fails with
//! [`DbError::Disconnected`]. Each backend call is bounded by the layer's
//! timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chaintwin_types::{DigitalTwinSnapshot, SessionCacheEntry, SimulationCacheEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dragonfly::DragonflyPool;
use crate::error::{DbError, bounded};
use crate::memory::InMemoryCache;

/// Time to live of cached simulation results.
pub const SIMULATION_TTL: Duration = Duration::from_secs(3600);

/// Time to live of cached sessions, reset on every activity update.
pub const SESSION_TTL: Duration = Duration::from_secs(86_400);

/// Time to live of each digital-twin snapshot.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

/// Default timeout for a single cache call.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

const SNAPSHOT_PREFIX: &str = "twin:snapshot:";
const SNAPSHOT_LATEST_KEY: &str = "twin:snapshot:latest";
const SNAPSHOT_INDEX_KEY: &str = "twin:snapshot:index";

/// Storage behind a [`CacheLayer`].
///
/// Uses enum dispatch rather than a trait object so the async methods stay
/// statically dispatched.
#[derive(Clone)]
pub enum CacheBackend {
    /// A `Dragonfly` / Redis server.
    Dragonfly(DragonflyPool),
    /// An in-process map, for tests and single-node development.
    InMemory(InMemoryCache),
}

impl CacheBackend {
    async fn connect(&self) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.connect().await,
            Self::InMemory(_) => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.disconnect().await,
            Self::InMemory(_) => Ok(()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        match self {
            Self::Dragonfly(pool) => pool.get(key).await,
            Self::InMemory(mem) => Ok(mem.get(key).await),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.set(key, value, ttl).await,
            Self::InMemory(mem) => {
                mem.set(key, value, ttl).await;
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.delete(key).await,
            Self::InMemory(mem) => {
                mem.delete(key).await;
                Ok(())
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, DbError> {
        match self {
            Self::Dragonfly(pool) => pool.exists(key).await,
            Self::InMemory(mem) => Ok(mem.exists(key).await),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, DbError> {
        match self {
            Self::Dragonfly(pool) => pool.ttl(key).await,
            Self::InMemory(mem) => Ok(mem.ttl(key).await),
        }
    }

    async fn set_if_newer(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, DbError> {
        match self {
            Self::Dragonfly(pool) => pool.set_if_newer(key, value, ttl).await,
            Self::InMemory(mem) => Ok(mem.set_if_newer(key, value, ttl).await),
        }
    }

    async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, DbError> {
        match self {
            Self::Dragonfly(pool) => pool.set_if_exists(key, value, ttl).await,
            Self::InMemory(mem) => Ok(mem.set_if_exists(key, value, ttl).await),
        }
    }

    async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.add_to_set(key, member, ttl).await,
            Self::InMemory(mem) => {
                mem.add_to_set(key, member, ttl).await;
                Ok(())
            }
        }
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), DbError> {
        match self {
            Self::Dragonfly(pool) => pool.remove_from_set(key, member).await,
            Self::InMemory(mem) => {
                mem.remove_from_set(key, member).await;
                Ok(())
            }
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, DbError> {
        match self {
            Self::Dragonfly(pool) => pool.set_members(key).await,
            Self::InMemory(mem) => Ok(mem.set_members(key).await),
        }
    }
}

/// Injected, explicitly connected cache handle.
///
/// Clones share the backend and the connection state.
#[derive(Clone)]
pub struct CacheLayer {
    backend: CacheBackend,
    timeout: Duration,
    connected: Arc<AtomicBool>,
}

impl CacheLayer {
    /// Wrap a backend. The layer starts disconnected.
    pub fn new(backend: CacheBackend) -> Self {
        Self {
            backend,
            timeout: DEFAULT_CACHE_TIMEOUT,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Convenience constructor for an in-memory layer.
    pub fn in_memory() -> Self {
        Self::new(CacheBackend::InMemory(InMemoryCache::new()))
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The backend this layer dispatches to.
    pub const fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    /// Open the backend connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the backend cannot be reached
    /// within the timeout.
    pub async fn connect(&self) -> Result<(), DbError> {
        bounded(self.timeout, "cache connect", self.backend.connect()).await?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Close the backend connection. Subsequent operations fail until
    /// [`CacheLayer::connect`] is called again.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the backend fails to close
    /// cleanly. The layer is marked disconnected either way.
    pub async fn disconnect(&self) -> Result<(), DbError> {
        self.connected.store(false, Ordering::Release);
        bounded(self.timeout, "cache disconnect", self.backend.disconnect()).await
    }

    /// Whether the layer is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<(), DbError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DbError::Disconnected)
        }
    }

    // =========================================================================
    // Generic key-value operations
    // =========================================================================

    /// Read the raw value at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        self.check()?;
        bounded(self.timeout, "cache get", self.backend.get(key)).await
    }

    /// Store `value` at `key`, overwriting any previous value. `ttl` of
    /// `None` stores without expiry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DbError> {
        self.check()?;
        bounded(self.timeout, "cache set", self.backend.set(key, value, ttl)).await
    }

    /// Delete `key`. Deleting an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        self.check()?;
        bounded(self.timeout, "cache delete", self.backend.delete(key)).await
    }

    /// Whether `key` exists and has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn exists(&self, key: &str) -> Result<bool, DbError> {
        self.check()?;
        bounded(self.timeout, "cache exists", self.backend.exists(key)).await
    }

    /// Remaining time to live of `key`; `None` if missing or unexpiring.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, DbError> {
        self.check()?;
        bounded(self.timeout, "cache ttl", self.backend.ttl(key)).await
    }

    /// Serialize `value` as JSON and store it at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if serialization fails, otherwise
    /// as [`CacheLayer::set`].
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), DbError> {
        let json = serde_json::to_string(value)?;
        self.set(key, &json, ttl).await
    }

    /// Read the value at `key` and deserialize it from JSON.
    ///
    /// A value that no longer decodes (e.g. written by an older release) is
    /// logged, evicted, and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DbError> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Evicting undecodable cache entry");
                self.delete(key).await?;
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Simulation Results -- simulation:{scenario}:{hash}
    // =========================================================================

    /// Cache a simulation result for one hour.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or the write fails.
    pub async fn cache_simulation_result(
        &self,
        scenario_id: &str,
        result_hash: &str,
        result: serde_json::Value,
    ) -> Result<SimulationCacheEntry, DbError> {
        let entry = SimulationCacheEntry {
            scenario_id: scenario_id.to_owned(),
            result_hash: result_hash.to_owned(),
            result,
            timestamp: Utc::now(),
        };
        let key = simulation_key(scenario_id, result_hash);
        self.set_json(&key, &entry, Some(SIMULATION_TTL)).await?;
        tracing::debug!(scenario_id, result_hash, "Cached simulation result");
        Ok(entry)
    }

    /// Read a cached simulation result payload.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn get_simulation_result(
        &self,
        scenario_id: &str,
        result_hash: &str,
    ) -> Result<Option<serde_json::Value>, DbError> {
        let entry: Option<SimulationCacheEntry> = self
            .get_json(&simulation_key(scenario_id, result_hash))
            .await?;
        Ok(entry.map(|e| e.result))
    }

    /// Read the full cached simulation entry, including when it was cached.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn get_simulation_entry(
        &self,
        scenario_id: &str,
        result_hash: &str,
    ) -> Result<Option<SimulationCacheEntry>, DbError> {
        self.get_json(&simulation_key(scenario_id, result_hash)).await
    }

    // =========================================================================
    // Sessions -- session:{id}
    // =========================================================================

    /// Cache a session for 24 hours.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or the write fails.
    pub async fn cache_session(&self, session: &SessionCacheEntry) -> Result<(), DbError> {
        self.set_json(&session_key(&session.session_id), session, Some(SESSION_TTL))
            .await
    }

    /// Read a cached session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionCacheEntry>, DbError> {
        self.get_json(&session_key(session_id)).await
    }

    /// Record activity on a session.
    ///
    /// The session is re-written wholesale with a fresh `last_activity` and a
    /// full 24-hour TTL. Returns the refreshed session, or `None` if it had
    /// already expired or been deleted. The write only lands on a key that
    /// still exists, so a concurrent logout is never undone.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read or write fails.
    pub async fn update_session_activity(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionCacheEntry>, DbError> {
        let Some(mut session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        session.last_activity = Utc::now();
        Ok(self.refresh_session(&session).await?.then_some(session))
    }

    /// Re-write a session only if it is still cached. Returns whether the
    /// write landed.
    async fn refresh_session(&self, session: &SessionCacheEntry) -> Result<bool, DbError> {
        let value = serde_json::to_string(session)?;
        self.check()?;
        bounded(
            self.timeout,
            "cache session refresh",
            self.backend.set_if_exists(
                &session_key(&session.session_id),
                &value,
                Some(SESSION_TTL),
            ),
        )
        .await
    }

    /// Delete a session (logout). Deleting an unknown session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn delete_session(&self, session_id: &str) -> Result<(), DbError> {
        self.delete(&session_key(session_id)).await
    }

    // =========================================================================
    // Digital Twin Snapshots -- twin:snapshot:*
    // =========================================================================

    /// Cache a twin snapshot for five minutes.
    ///
    /// The `twin:snapshot:latest` pointer is moved to this snapshot unless it
    /// already points at a newer one, so reading the latest snapshot is a
    /// single lookup. The move is one atomic compare-and-set on the backend.
    ///
    /// The index expires with the newest write and drops stamps whose
    /// snapshot has expired, so it only ever holds live snapshots plus those
    /// that lapsed since the previous write.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if serialization or any write fails.
    pub async fn cache_digital_twin_state(
        &self,
        snapshot: &DigitalTwinSnapshot,
    ) -> Result<(), DbError> {
        let stamp = snapshot_stamp(snapshot.timestamp);
        self.set_json(&snapshot_key(&stamp), snapshot, Some(SNAPSHOT_TTL))
            .await?;
        self.backend_add_to_index(&stamp).await?;
        let pruned = self.prune_snapshot_index().await?;
        let moved = self.backend_advance_latest(&stamp, SNAPSHOT_TTL).await?;

        tracing::debug!(
            timestamp = %stamp,
            version = %snapshot.version,
            pointer_moved = moved,
            pruned,
            "Cached twin snapshot"
        );
        Ok(())
    }

    /// Drop index members whose snapshot has expired. Returns how many.
    async fn prune_snapshot_index(&self) -> Result<usize, DbError> {
        let mut pruned = 0_usize;
        for stamp in self.backend_index_members().await? {
            if !self.exists(&snapshot_key(&stamp)).await? {
                self.backend_remove_from_index(&stamp).await?;
                pruned = pruned.saturating_add(1);
            }
        }
        Ok(pruned)
    }

    /// The live snapshot with the greatest timestamp.
    ///
    /// Follows the `latest` pointer first. If the pointed-to snapshot has
    /// expired, falls back to the snapshot index and prunes dead entries
    /// from it along the way.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn get_latest_digital_twin_state(
        &self,
    ) -> Result<Option<DigitalTwinSnapshot>, DbError> {
        if let Some(stamp) = self.get(SNAPSHOT_LATEST_KEY).await?
            && let Some(snapshot) = self.get_json(&snapshot_key(&stamp)).await?
        {
            return Ok(Some(snapshot));
        }

        let members = self.backend_index_members().await?;
        let mut stamps: Vec<(DateTime<Utc>, String)> = members
            .into_iter()
            .filter_map(|m| parse_stamp(&m).map(|ts| (ts, m)))
            .collect();
        stamps.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        for (_, stamp) in stamps {
            if let Some(snapshot) = self.get_json::<DigitalTwinSnapshot>(&snapshot_key(&stamp)).await? {
                let remaining = self.ttl(&snapshot_key(&stamp)).await?.unwrap_or(SNAPSHOT_TTL);
                self.backend_advance_latest(&stamp, remaining).await?;
                return Ok(Some(snapshot));
            }
            self.backend_remove_from_index(&stamp).await?;
        }
        Ok(None)
    }

    /// Delete every cached twin snapshot and the latest pointer.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Disconnected`] or [`DbError::Connectivity`].
    pub async fn invalidate_digital_twin_cache(&self) -> Result<(), DbError> {
        let members = self.backend_index_members().await?;
        let count = members.len();
        for stamp in members {
            self.delete(&snapshot_key(&stamp)).await?;
        }
        self.delete(SNAPSHOT_INDEX_KEY).await?;
        self.delete(SNAPSHOT_LATEST_KEY).await?;
        tracing::info!(count, "Invalidated twin snapshot cache");
        Ok(())
    }

    async fn backend_add_to_index(&self, stamp: &str) -> Result<(), DbError> {
        self.check()?;
        bounded(
            self.timeout,
            "cache index add",
            self.backend
                .add_to_set(SNAPSHOT_INDEX_KEY, stamp, Some(SNAPSHOT_TTL)),
        )
        .await
    }

    /// Point `latest` at `stamp` unless it already names a later one.
    /// Stamps are fixed width, so string order is time order.
    async fn backend_advance_latest(&self, stamp: &str, ttl: Duration) -> Result<bool, DbError> {
        self.check()?;
        bounded(
            self.timeout,
            "cache latest pointer",
            self.backend.set_if_newer(SNAPSHOT_LATEST_KEY, stamp, ttl),
        )
        .await
    }

    async fn backend_remove_from_index(&self, stamp: &str) -> Result<(), DbError> {
        self.check()?;
        bounded(
            self.timeout,
            "cache index remove",
            self.backend.remove_from_set(SNAPSHOT_INDEX_KEY, stamp),
        )
        .await
    }

    async fn backend_index_members(&self) -> Result<Vec<String>, DbError> {
        self.check()?;
        bounded(
            self.timeout,
            "cache index read",
            self.backend.set_members(SNAPSHOT_INDEX_KEY),
        )
        .await
    }
}

/// Cache key for a node's read-through copy.
pub fn node_key(node_id: &str) -> String {
    format!("node:{node_id}")
}

fn simulation_key(scenario_id: &str, result_hash: &str) -> String {
    format!("simulation:{scenario_id}:{result_hash}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn snapshot_key(stamp: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{stamp}")
}

/// Fixed-width RFC 3339 form so that stamps are unambiguous keys.
fn snapshot_stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    async fn connected() -> CacheLayer {
        let cache = CacheLayer::in_memory();
        cache.connect().await.unwrap();
        cache
    }

    fn snapshot(ts: DateTime<Utc>, version: &str) -> DigitalTwinSnapshot {
        DigitalTwinSnapshot {
            timestamp: ts,
            version: version.to_owned(),
            state: json!({ "nodes": 3 }),
        }
    }

    #[tokio::test]
    async fn operations_fail_while_disconnected() {
        let cache = CacheLayer::in_memory();
        assert!(matches!(cache.get("k").await, Err(DbError::Disconnected)));

        cache.connect().await.unwrap();
        cache.set("k", "v", None).await.unwrap();
        cache.disconnect().await.unwrap();

        assert!(!cache.is_connected());
        assert!(matches!(cache.set("k", "v", None).await, Err(DbError::Disconnected)));
        assert!(matches!(cache.delete("k").await, Err(DbError::Disconnected)));
        assert!(matches!(cache.exists("k").await, Err(DbError::Disconnected)));
        assert!(matches!(cache.ttl("k").await, Err(DbError::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_until_ttl_elapses() {
        let cache = connected().await;
        cache.set("k", "v", Some(Duration::from_secs(30))).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn repeated_set_and_delete_are_idempotent() {
        let cache = connected().await;
        cache.set("k", "a", None).await.unwrap();
        cache.set("k", "b", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));

        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn undecodable_json_is_a_miss() {
        let cache = connected().await;
        cache.set("session:s1", "{not json", None).await.unwrap();
        assert_eq!(cache.get_session("s1").await.unwrap(), None);
        assert!(!cache.exists("session:s1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn session_activity_resets_the_full_ttl() {
        let cache = connected().await;
        cache
            .cache_session(&SessionCacheEntry::new("s1", "u1"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(80_000)).await;
        let refreshed = cache.update_session_activity("s1").await.unwrap();
        assert!(refreshed.is_some());
        assert_eq!(cache.ttl("session:s1").await.unwrap(), Some(SESSION_TTL));

        tokio::time::advance(Duration::from_secs(80_000)).await;
        assert!(cache.get_session("s1").await.unwrap().is_some());

        cache.delete_session("s1").await.unwrap();
        assert!(cache.update_session_activity("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_snapshot_pointer_never_moves_backwards() {
        let cache = connected().await;
        let t0 = Utc::now();
        let newer = snapshot(t0 + TimeDelta::seconds(10), "v2");
        let older = snapshot(t0, "v1");

        cache.cache_digital_twin_state(&newer).await.unwrap();
        cache.cache_digital_twin_state(&older).await.unwrap();

        let latest = cache.get_latest_digital_twin_state().await.unwrap().unwrap();
        assert_eq!(latest.version, "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn latest_falls_back_to_newest_live_snapshot() {
        let cache = connected().await;
        let t0 = Utc::now();
        cache
            .cache_digital_twin_state(&snapshot(t0 + TimeDelta::seconds(60), "newest"))
            .await
            .unwrap();

        // An older snapshot written later outlives the newest one.
        tokio::time::advance(Duration::from_secs(200)).await;
        cache
            .cache_digital_twin_state(&snapshot(t0, "older"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(150)).await;
        let latest = cache.get_latest_digital_twin_state().await.unwrap().unwrap();
        assert_eq!(latest.version, "older");

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(cache.get_latest_digital_twin_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_every_snapshot() {
        let cache = connected().await;
        let t0 = Utc::now();
        for i in 0..3 {
            cache
                .cache_digital_twin_state(&snapshot(t0 + TimeDelta::seconds(i), "v"))
                .await
                .unwrap();
        }
        cache.invalidate_digital_twin_cache().await.unwrap();
        assert!(cache.get_latest_digital_twin_state().await.unwrap().is_none());
        assert!(!cache.exists(SNAPSHOT_INDEX_KEY).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_activity_update_stays_logged_out() {
        let cache = connected().await;
        cache
            .cache_session(&SessionCacheEntry::new("s1", "u1"))
            .await
            .unwrap();

        // The activity update has read the session when the logout lands.
        let mut session = cache.get_session("s1").await.unwrap().unwrap();
        cache.delete_session("s1").await.unwrap();
        session.last_activity = Utc::now();

        assert!(!cache.refresh_session(&session).await.unwrap());
        assert!(cache.get_session("s1").await.unwrap().is_none());
        assert!(cache.update_session_activity("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_index_stays_bounded_under_steady_writes() {
        let cache = connected().await;
        let t0 = Utc::now();
        for i in 0..1000_i64 {
            let version = format!("v{i}");
            cache
                .cache_digital_twin_state(&snapshot(t0 + TimeDelta::seconds(60 * i), &version))
                .await
                .unwrap();
            let latest = cache.get_latest_digital_twin_state().await.unwrap().unwrap();
            assert_eq!(latest.version, version);
            tokio::time::advance(Duration::from_secs(60)).await;
        }

        // One write per minute with a five-minute TTL leaves five live stamps.
        let members = cache.backend_index_members().await.unwrap();
        assert!(members.len() <= 5, "index holds {} stamps", members.len());

        tokio::time::advance(SNAPSHOT_TTL).await;
        assert!(!cache.exists(SNAPSHOT_INDEX_KEY).await.unwrap());
        assert!(cache.get_latest_digital_twin_state().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_snapshot_writers_leave_the_newest_as_latest() {
        let cache = connected().await;
        let t0 = Utc::now();
        let writers = 32_i64;
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let mut handles = Vec::new();
        for i in 0..writers {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            // Interleave offsets so later spawns are not always newer.
            let offset = (i * 7) % writers;
            handles.push(tokio::spawn(async move {
                let snap = snapshot(t0 + TimeDelta::seconds(offset), &format!("v{offset}"));
                barrier.wait().await;
                cache.cache_digital_twin_state(&snap).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let latest = cache.get_latest_digital_twin_state().await.unwrap().unwrap();
        assert_eq!(latest.version, format!("v{}", writers - 1));
        assert_eq!(
            cache.get(SNAPSHOT_LATEST_KEY).await.unwrap(),
            Some(snapshot_stamp(t0 + TimeDelta::seconds(writers - 1)))
        );
    }
}
