//! Typed facade over the keyed TTL store (Redis).
//!
//! All writes are idempotent overwrites. Multi-key work goes through
//! [`CachePipeline`] so a full cycle write or a registry import batch costs
//! one network round-trip. There are no transactional semantics beyond
//! pipelining.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache operation failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Cache key layout. Everything the process publishes lives under these.
pub mod keys {
    /// Blended region set, JSON array.
    pub fn flights(region: &str) -> String {
        format!("{region}:flights")
    }

    /// Helicopter subset of the blended set, JSON array.
    pub fn choppers(region: &str) -> String {
        format!("{region}:choppers")
    }

    /// Last raw snapshot for one source, JSON array.
    pub fn raw(region: &str, source: &str) -> String {
        format!("{region}:raw:{source}")
    }

    /// Push buffer for one station.
    pub fn push_buffer(region: &str, station: &str) -> String {
        format!("{region}:push:{station}")
    }

    /// Match pattern covering every station buffer of a region.
    pub fn push_pattern(region: &str) -> String {
        format!("{region}:push:*")
    }

    /// Individual blended record for point lookup.
    pub fn aircraft_live(hex: &str) -> String {
        format!("aircraft_live:{hex}")
    }

    /// Registry hash for one airframe.
    pub fn aircraft_db(hex: &str) -> String {
        format!("aircraft_db:{hex}")
    }

    /// Match pattern covering the registry import.
    pub fn aircraft_db_pattern() -> String {
        "aircraft_db:*".to_string()
    }

    /// Per-region counter or gauge.
    pub fn stat(region: &str, name: &str) -> String {
        format!("stats:{region}:{name}")
    }

    /// Last-seen wide-area credit gauge.
    pub const OPENSKY_CREDITS: &str = "stats:opensky:credits_remaining";

    /// Wide-area backoff deadline, unix seconds.
    pub const OPENSKY_BACKOFF_UNTIL: &str = "stats:opensky:backoff_until";
}

/// Thread-safe, connection-pooled cache client.
///
/// Clones share one multiplexed connection that reconnects on its own,
/// which is what lets a degraded scheduler recover without bespoke retry
/// logic.
#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
    default_ttl: Duration,
}

impl CacheClient {
    /// Connect and verify the server is reachable.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url().as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let cache = Self {
            conn,
            default_ttl: config.default_ttl(),
        };
        cache.ping().await?;
        Ok(cache)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn set_json_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.set_with_ttl(key, &raw, ttl).await
    }

    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Gauge read; absent or non-numeric values read as `None`.
    pub async fn get_i64(&self, key: &str) -> Result<Option<i64>, CacheError> {
        Ok(self
            .get_raw(key)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok()))
    }

    /// Gauge write, no TTL.
    pub async fn set_i64(&self, key: &str, value: i64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    /// Keys matching a pattern. Used for station push buffers and the
    /// registry presence check; both keyspaces are small and bounded.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    /// Fetch many string values in one round-trip.
    pub async fn get_many_raw(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let mut conn = self.conn.clone();
        Ok(pipe.query_async(&mut conn).await?)
    }

    /// Fetch many hashes in one round-trip. Empty maps mean absent keys.
    pub async fn hgetall_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<HashMap<String, String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        let mut conn = self.conn.clone();
        Ok(pipe.query_async(&mut conn).await?)
    }

    /// Start a write batch that executes as one round-trip.
    pub fn pipeline(&self) -> CachePipeline {
        CachePipeline {
            pipe: redis::pipe(),
            conn: self.conn.clone(),
            commands: 0,
        }
    }
}

/// Accumulates writes and executes them in a single round-trip.
pub struct CachePipeline {
    pipe: redis::Pipeline,
    conn: ConnectionManager,
    commands: usize,
}

impl CachePipeline {
    pub fn set_with_ttl(&mut self, key: &str, value: &str, ttl: Duration) -> &mut Self {
        self.pipe.set_ex(key, value, ttl.as_secs()).ignore();
        self.commands += 1;
        self
    }

    pub fn set_i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.pipe.set(key, value).ignore();
        self.commands += 1;
        self
    }

    pub fn incr_by(&mut self, key: &str, delta: u64) -> &mut Self {
        self.pipe.incr(key, delta).ignore();
        self.commands += 1;
        self
    }

    pub fn hset_fields(&mut self, key: &str, fields: &[(&str, &str)]) -> &mut Self {
        self.pipe.hset_multiple(key, fields).ignore();
        self.commands += 1;
        self
    }

    pub fn del(&mut self, key: &str) -> &mut Self {
        self.pipe.del(key).ignore();
        self.commands += 1;
        self
    }

    pub fn len(&self) -> usize {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands == 0
    }

    /// Flush every queued command. A no-op for an empty batch.
    pub async fn execute(mut self) -> Result<(), CacheError> {
        if self.commands == 0 {
            return Ok(());
        }
        self.pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::flights("etex"), "etex:flights");
        assert_eq!(keys::choppers("etex"), "etex:choppers");
        assert_eq!(keys::raw("etex", "opensky"), "etex:raw:opensky");
        assert_eq!(keys::push_buffer("etex", "ETEX01"), "etex:push:ETEX01");
        assert_eq!(keys::push_pattern("etex"), "etex:push:*");
        assert_eq!(keys::aircraft_live("a1b2c3"), "aircraft_live:a1b2c3");
        assert_eq!(keys::aircraft_db("a1b2c3"), "aircraft_db:a1b2c3");
        assert_eq!(keys::stat("etex", "cycles"), "stats:etex:cycles");
        assert_eq!(keys::OPENSKY_CREDITS, "stats:opensky:credits_remaining");
        assert_eq!(keys::OPENSKY_BACKOFF_UNTIL, "stats:opensky:backoff_until");
    }
}
