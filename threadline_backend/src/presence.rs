//! Connection counters with expiry, answering "is this user online?".
//!
//! Two backends share the [`PresenceStore`] contract: an in-process map for
//! single-node deployments and tests, and Redis for anything that runs more
//! than one server process. Callers go through [`Presence`], which never
//! lets a backend failure escape.

use crate::config::PresenceConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence backend unavailable: {0}")]
    Backend(#[from] redis::RedisError),
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Adds one live connection and resets the expiry. Returns the new count.
    async fn increment(&self, user_id: i64) -> Result<u64, PresenceError>;
    /// Removes one live connection. Reaching zero deletes the counter.
    async fn decrement(&self, user_id: i64) -> Result<u64, PresenceError>;
    /// Extends the expiry; an absent counter is re-created at 1.
    async fn refresh(&self, user_id: i64) -> Result<u64, PresenceError>;
    async fn is_online(&self, user_id: i64) -> Result<bool, PresenceError>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: Instant,
}

impl Entry {
    fn live_count(&self, now: Instant) -> u64 {
        if now >= self.expires_at {
            0
        } else {
            self.count
        }
    }
}

pub struct MemoryPresenceStore {
    entries: DashMap<i64, Entry>,
    ttl: Duration,
}

impl MemoryPresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn increment(&self, user_id: i64) -> Result<u64, PresenceError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(user_id).or_insert(Entry {
            count: 0,
            expires_at: now,
        });
        entry.count = entry.live_count(now) + 1;
        entry.expires_at = now + self.ttl;
        Ok(entry.count)
    }

    async fn decrement(&self, user_id: i64) -> Result<u64, PresenceError> {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut remaining = 0;
        // remove_if holds the shard lock, so the read-modify-delete is atomic per key.
        self.entries.remove_if_mut(&user_id, |_, entry| {
            let next = entry.live_count(now).saturating_sub(1);
            if next == 0 {
                return true;
            }
            entry.count = next;
            entry.expires_at = now + ttl;
            remaining = next;
            false
        });
        Ok(remaining)
    }

    async fn refresh(&self, user_id: i64) -> Result<u64, PresenceError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(user_id).or_insert(Entry {
            count: 0,
            expires_at: now,
        });
        entry.count = entry.live_count(now).max(1);
        entry.expires_at = now + self.ttl;
        Ok(entry.count)
    }

    async fn is_online(&self, user_id: i64) -> Result<bool, PresenceError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&user_id)
            .map(|entry| entry.live_count(now) > 0)
            .unwrap_or(false))
    }
}

/// Counters kept in Redis under `presence:<user_id>`. Every mutation is a
/// single atomic command or MULTI pipeline; nothing reads then writes.
pub struct RedisPresenceStore {
    conn: redis::aio::MultiplexedConnection,
    ttl_secs: u64,
}

impl RedisPresenceStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    fn key(user_id: i64) -> String {
        format!("presence:{user_id}")
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn increment(&self, user_id: i64) -> Result<u64, PresenceError> {
        let key = Self::key(user_id);
        let mut conn = self.conn.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn decrement(&self, user_id: i64) -> Result<u64, PresenceError> {
        let key = Self::key(user_id);
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("DECR").arg(&key).query_async(&mut conn).await?;
        if count <= 0 {
            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            return Ok(0);
        }
        let _: i64 = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(count as u64)
    }

    async fn refresh(&self, user_id: i64) -> Result<u64, PresenceError> {
        let key = Self::key(user_id);
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("EX")
            .arg(self.ttl_secs)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_some() {
            return Ok(1);
        }
        let (count,): (Option<i64>,) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn is_online(&self, user_id: i64) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = redis::cmd("GET")
            .arg(Self::key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }
}

/// Fail-open front for a [`PresenceStore`]: errors are logged, mutations
/// report zero and queries report offline.
#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
}

impl Presence {
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryPresenceStore::new(ttl)), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Uses Redis when configured and reachable, the in-process store otherwise.
    pub async fn connect(config: &PresenceConfig) -> Self {
        let Some(url) = config.redis_url.as_deref() else {
            return Self::in_memory(config.ttl);
        };
        match RedisPresenceStore::connect(url, config.ttl).await {
            Ok(store) => {
                tracing::info!("presence counters stored in redis");
                Self::new(Arc::new(store), config.ttl)
            }
            Err(err) => {
                tracing::warn!(error = %err, "redis unavailable, presence kept in memory");
                Self::in_memory(config.ttl)
            }
        }
    }

    pub async fn increment(&self, user_id: i64) -> u64 {
        self.store.increment(user_id).await.unwrap_or_else(|err| {
            tracing::warn!(user_id, error = %err, "presence increment failed");
            0
        })
    }

    pub async fn decrement(&self, user_id: i64) -> u64 {
        self.store.decrement(user_id).await.unwrap_or_else(|err| {
            tracing::warn!(user_id, error = %err, "presence decrement failed");
            0
        })
    }

    pub async fn refresh(&self, user_id: i64) -> u64 {
        self.store.refresh(user_id).await.unwrap_or_else(|err| {
            tracing::warn!(user_id, error = %err, "presence refresh failed");
            0
        })
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.store.is_online(user_id).await.unwrap_or_else(|err| {
            tracing::warn!(user_id, error = %err, "presence lookup failed");
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl PresenceStore for Unreachable {
        async fn increment(&self, _: i64) -> Result<u64, PresenceError> {
            Err(unreachable_error())
        }
        async fn decrement(&self, _: i64) -> Result<u64, PresenceError> {
            Err(unreachable_error())
        }
        async fn refresh(&self, _: i64) -> Result<u64, PresenceError> {
            Err(unreachable_error())
        }
        async fn is_online(&self, _: i64) -> Result<bool, PresenceError> {
            Err(unreachable_error())
        }
    }

    fn unreachable_error() -> PresenceError {
        PresenceError::Backend(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }

    #[tokio::test]
    async fn balanced_increments_return_to_offline() {
        let presence = Presence::in_memory(Duration::from_secs(60));
        for expected in 1..=3 {
            assert_eq!(presence.increment(7).await, expected);
        }
        assert!(presence.is_online(7).await);
        assert_eq!(presence.decrement(7).await, 2);
        assert_eq!(presence.decrement(7).await, 1);
        assert_eq!(presence.decrement(7).await, 0);
        assert!(!presence.is_online(7).await);
        assert_eq!(presence.decrement(7).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_expire_after_ttl() {
        let presence = Presence::in_memory(Duration::from_secs(60));
        presence.increment(1).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(presence.is_online(1).await);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!presence.is_online(1).await);
        // An expired counter starts over rather than resuming.
        assert_eq!(presence.increment(1).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_and_self_heals() {
        let presence = Presence::in_memory(Duration::from_secs(60));
        assert_eq!(presence.refresh(5).await, 1);
        presence.increment(5).await;
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(presence.refresh(5).await, 2);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(presence.is_online(5).await);
    }

    #[tokio::test]
    async fn backend_failures_fail_open() {
        let presence = Presence::new(Arc::new(Unreachable), Duration::from_secs(60));
        assert_eq!(presence.increment(1).await, 0);
        assert_eq!(presence.decrement(1).await, 0);
        assert_eq!(presence.refresh(1).await, 0);
        assert!(!presence.is_online(1).await);
    }
}
