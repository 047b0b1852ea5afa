//! In-process cache backend.
//!
//! Mirrors the subset of `Dragonfly` semantics the cache layer relies on:
//! string values and string sets, both with optional expiry. Expiry is
//! measured with [`tokio::time::Instant`], so tests running on a paused
//! clock can advance simulated time with `tokio::time::advance`.
//!
//! Expired entries are treated as absent on every read and purged lazily.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value: value.to_owned(),
            // A TTL too large to represent never expires.
            expires_at: ttl.and_then(|t| now.checked_add(t)),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Members {
    items: BTreeSet<String>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    values: BTreeMap<String, Entry>,
    sets: BTreeMap<String, Members>,
}

impl State {
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        let expired = self.values.get(key).is_some_and(|e| !e.is_live(now));
        if expired {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn live_set(&mut self, key: &str, now: Instant) -> Option<&mut Members> {
        let expired = self
            .sets
            .get(key)
            .is_some_and(|m| m.expires_at.is_some_and(|at| at <= now));
        if expired {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }
}

/// Shared in-memory key-value store with TTL support.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    state: Arc<Mutex<State>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the value at `key` if it is live.
    pub async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.live(key, now).map(|e| e.value.clone())
    }

    /// Store `value` at `key`, replacing any previous value and expiry.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = Entry::new(value, ttl, Instant::now());
        self.state.lock().await.values.insert(key.to_owned(), entry);
    }

    /// Store `value` at `key` only if the current live value is absent or
    /// sorts at or below `value`. Returns whether the write happened.
    pub async fn set_if_newer(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.live(key, now).is_some_and(|e| e.value.as_str() > value) {
            return false;
        }
        state
            .values
            .insert(key.to_owned(), Entry::new(value, Some(ttl), now));
        true
    }

    /// Replace the value at `key` only if a live value is already there.
    /// Returns whether the write happened.
    pub async fn set_if_exists(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.live(key, now).is_none() {
            return false;
        }
        state
            .values
            .insert(key.to_owned(), Entry::new(value, ttl, now));
        true
    }

    /// Remove `key` from both the value and set namespaces.
    pub async fn delete(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.values.remove(key);
        state.sets.remove(key);
    }

    /// Whether `key` holds a live value or a non-empty set.
    pub async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.live(key, now).is_some() || state.live_set(key, now).is_some()
    }

    /// Remaining time to live, or `None` for missing or unexpiring keys.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Add `member` to the set at `key`. With a `ttl`, the whole set
    /// expires that long after this call; without one, any expiry is kept.
    pub async fn add_to_set(&self, key: &str, member: &str, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        // Purge an expired set so stale members are not carried forward.
        let _ = state.live_set(key, now);
        let set = state.sets.entry(key.to_owned()).or_default();
        set.items.insert(member.to_owned());
        if let Some(ttl) = ttl {
            set.expires_at = now.checked_add(ttl);
        }
    }

    /// Remove `member` from the set at `key`, dropping the set when empty.
    pub async fn remove_from_set(&self, key: &str, member: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let now_empty = state.live_set(key, now).is_some_and(|set| {
            set.items.remove(member);
            set.items.is_empty()
        });
        if now_empty {
            state.sets.remove(key);
        }
    }

    /// Members of the set at `key`.
    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        self.state
            .lock()
            .await
            .live_set(key, now)
            .map(|set| set.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live string keys. Used by tests to assert cache population.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.values.values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the cache holds no live string keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
