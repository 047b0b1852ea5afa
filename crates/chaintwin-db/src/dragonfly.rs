//! `Dragonfly` (Redis-compatible) cache backend.
//!
//! This is the production backend behind [`CacheLayer`](crate::cache::CacheLayer).
//! It exposes only the primitive string and set commands the cache layer
//! needs, plus a conditional pointer write run as a Lua script. Key naming
//! and JSON encoding live one level up.
//!
//! Unlike a process-wide singleton, a [`DragonflyPool`] is constructed
//! explicitly and has a visible lifecycle: [`DragonflyPool::new`] builds the
//! client without touching the network, [`connect`](DragonflyPool::connect)
//! opens the connection and [`disconnect`](DragonflyPool::disconnect)
//! closes it.

use std::time::Duration;

use fred::prelude::*;
use fred::types::{Expiration, SetOptions};

use crate::error::DbError;

/// Compare-and-set for a pointer key holding a fixed-width timestamp.
/// Writes `ARGV[1]` with `EX ARGV[2]` unless the current value sorts after it.
const SET_IF_NEWER_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current and current > ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return 1
";

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
///
/// Wraps a [`fred::prelude::Client`]. Clones share the same connection.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Build a client for the given URL without connecting.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed or the
    /// client cannot be built.
    pub fn new(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config)
            .build()
            .map_err(|e| DbError::Config(format!("Failed to build Dragonfly client: {e}")))?;

        Ok(Self { client })
    }

    /// Open the connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the connection fails.
    pub async fn connect(&self) -> Result<(), DbError> {
        self.client
            .init()
            .await
            .map_err(|e| DbError::dragonfly("cache connect", &e))?;
        tracing::info!("Connected to Dragonfly");
        Ok(())
    }

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the server could not be told to
    /// close the connection.
    pub async fn disconnect(&self) -> Result<(), DbError> {
        self.client
            .quit()
            .await
            .map_err(|e| DbError::dragonfly("cache disconnect", &e))?;
        tracing::info!("Disconnected from Dragonfly");
        Ok(())
    }

    /// Read the raw string stored at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the read fails.
    pub async fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        self.client
            .get(key)
            .await
            .map_err(|e| DbError::dragonfly("cache get", &e))
    }

    /// Store `value` at `key`, optionally expiring after `ttl`.
    ///
    /// A `ttl` shorter than one second is rounded up to one second.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the write fails.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), DbError> {
        let expiration = ttl.map(|t| Expiration::EX(ttl_seconds(t)));
        let _: () = self
            .client
            .set(key, value, expiration, None, false)
            .await
            .map_err(|e| DbError::dragonfly("cache set", &e))?;
        Ok(())
    }

    /// Store `value` at `key` unless the current value sorts after it.
    ///
    /// Runs as one server-side script, so concurrent writers cannot move
    /// the key backwards. Returns whether the write happened.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the script fails.
    pub async fn set_if_newer(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, DbError> {
        let args = vec![value.to_owned(), ttl_seconds(ttl).to_string()];
        let written: i64 = self
            .client
            .eval(SET_IF_NEWER_SCRIPT, key, args)
            .await
            .map_err(|e| DbError::dragonfly("cache set if newer", &e))?;
        Ok(written == 1)
    }

    /// Replace the value at `key` only if the key exists (`SET .. XX`).
    /// Returns whether the write happened.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the write fails.
    pub async fn set_if_exists(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, DbError> {
        let expiration = ttl.map(|t| Expiration::EX(ttl_seconds(t)));
        let reply: Option<String> = self
            .client
            .set(key, value, expiration, Some(SetOptions::XX), false)
            .await
            .map_err(|e| DbError::dragonfly("cache set if exists", &e))?;
        Ok(reply.is_some())
    }

    /// Delete `key`. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        let _: u32 = self
            .client
            .del(key)
            .await
            .map_err(|e| DbError::dragonfly("cache delete", &e))?;
        Ok(())
    }

    /// Whether `key` currently exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the check fails.
    pub async fn exists(&self, key: &str) -> Result<bool, DbError> {
        let count: u32 = self
            .client
            .exists(key)
            .await
            .map_err(|e| DbError::dragonfly("cache exists", &e))?;
        Ok(count > 0)
    }

    /// Remaining time to live of `key`.
    ///
    /// Returns `None` if the key does not exist or has no expiry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the query fails.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, DbError> {
        let secs: i64 = self
            .client
            .ttl(key)
            .await
            .map_err(|e| DbError::dragonfly("cache ttl", &e))?;
        // -2: missing key, -1: no expiry.
        Ok(u64::try_from(secs).ok().map(Duration::from_secs))
    }

    /// Add `member` to the set at `key`. With a `ttl`, the whole set
    /// expires that long after this call.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the write fails.
    pub async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DbError> {
        let _: u32 = self
            .client
            .sadd(key, member)
            .await
            .map_err(|e| DbError::dragonfly("cache sadd", &e))?;
        if let Some(ttl) = ttl {
            let _: bool = self
                .client
                .expire(key, ttl_seconds(ttl), None)
                .await
                .map_err(|e| DbError::dragonfly("cache expire", &e))?;
        }
        Ok(())
    }

    /// Remove `member` from the set at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the write fails.
    pub async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), DbError> {
        let _: u32 = self
            .client
            .srem(key, member)
            .await
            .map_err(|e| DbError::dragonfly("cache srem", &e))?;
        Ok(())
    }

    /// All members of the set at `key` (empty if the key is absent).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the read fails.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, DbError> {
        self.client
            .smembers(key)
            .await
            .map_err(|e| DbError::dragonfly("cache smembers", &e))
    }

    /// Flush all keys from the `Dragonfly` instance.
    ///
    /// **WARNING:** This deletes all data. Only use for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connectivity`] if the flush fails.
    pub async fn flush_all(&self) -> Result<(), DbError> {
        let _: () = self
            .client
            .flushall(false)
            .await
            .map_err(|e| DbError::dragonfly("cache flush", &e))?;
        Ok(())
    }
}

/// Whole seconds for `EX`, never zero (Redis rejects `EX 0`).
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs().max(1);
    i64::try_from(secs).unwrap_or(i64::MAX)
}
