//! Key-value store capability.
//!
//! The refresh-token store, the actives tracker, and the rotating key store
//! all sit on the same small surface: set/get/delete with per-key TTL, an
//! atomic set-if-absent for advisory locks, and prefix enumeration. Redis
//! provides it in production; [`MemoryKv`] provides it in-process for tests
//! and single-node experiments.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait Kv: Send + Sync {
    /// Store `value` under `key`, replacing any existing value. A `ttl`
    /// bounds the entry's lifetime; `None` persists until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Fetch the value under `key`. Expired and missing entries are
    /// indistinguishable.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`; returns whether an entry was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically store `value` only when `key` is absent. Returns whether
    /// the write won. Used as an advisory lock (the TTL bounds a crashed
    /// holder).
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Enumerate keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Redis-backed [`Kv`].
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to Redis and return a ready store.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is invalid or the initial connection
    /// fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .context("redis SETEX failed")?;
            }
            None => {
                let _: () = conn.set(key, value).await.context("redis SET failed")?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.context("redis GET failed")?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await.context("redis DEL failed")?;
        Ok(removed > 0)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // SET NX EX in one command so lock acquisition and its expiry are atomic.
        let mut conn = self.manager.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("redis SET NX failed")?;
        Ok(outcome.is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn
            .keys(format!("{prefix}*"))
            .await
            .context("redis KEYS failed")?;
        Ok(keys)
    }
}

/// In-process [`Kv`] with lazy expiry.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        // Lock poisoning only happens if a writer panicked; the map itself
        // stays consistent, so recover the guard.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.expired()),
            None => Ok(false),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.lock();
        let occupied = entries.get(key).is_some_and(|entry| !entry.expired());
        if occupied {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.lock();
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.expired())
            .map(|(key, _)| key.clone())
            .collect())
    }
}
