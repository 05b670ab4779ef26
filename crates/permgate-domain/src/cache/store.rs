//! Backing key-value stores for the permission cache.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;

/// Errors raised by a cache backing store.
///
/// The permission cache never propagates these; they turn into misses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheStoreError {
    /// The store cannot be reached.
    #[error("cache store unavailable: {message}")]
    Unavailable { message: String },

    /// A stored value could not be encoded or decoded.
    #[error("cache codec error: {message}")]
    Codec { message: String },
}

/// A key-value store with per-entry TTL.
///
/// This is the seam for an external cache service; [`MokaCacheStore`] is the
/// in-process implementation.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Reads a value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;

    /// Writes a value that expires after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError>;

    /// Removes a value. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheStoreError>;

    /// Remaining time-to-live of a key, `None` when absent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError>;

    /// Removes every value.
    async fn clear(&self) -> Result<(), CacheStoreError>;

    /// Whether other processes write to the same store.
    ///
    /// A shared store makes the local role index incomplete, so role
    /// invalidation has to flush everything.
    fn is_shared(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct MokaEntry {
    value: Vec<u8>,
    ttl: Duration,
    inserted_at: Instant,
}

/// Per-entry expiry driven by the TTL stored alongside each value.
struct PerEntryTtl;

impl Expiry<String, MokaEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MokaEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MokaEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache store backed by Moka.
///
/// Moka gives lock-free concurrent reads, bounded memory and background
/// TTL eviction.
pub struct MokaCacheStore {
    cache: Cache<String, MokaEntry>,
}

impl std::fmt::Debug for MokaCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaCacheStore")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MokaCacheStore {
    /// Creates a store holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Returns the approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending maintenance tasks (evictions). Useful for testing TTL behavior.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for MokaCacheStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CacheStore for MokaCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        Ok(self
            .cache
            .get(key)
            .await
            .filter(|entry| entry.inserted_at.elapsed() < entry.ttl)
            .map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError> {
        let entry = MokaEntry {
            value,
            ttl,
            inserted_at: Instant::now(),
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheStoreError> {
        Ok(self
            .cache
            .get(key)
            .await
            .and_then(|entry| entry.ttl.checked_sub(entry.inserted_at.elapsed()))
            .filter(|remaining| !remaining.is_zero()))
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.cache.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let store = MokaCacheStore::new(100);
        store
            .set("k", b"value".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn test_entries_expire_with_their_own_ttl() {
        let store = MokaCacheStore::new(100);
        store
            .set("short", b"a".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        store
            .set("long", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        store.run_pending_tasks().await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_ttl_reports_remaining_time() {
        let store = MokaCacheStore::new(100);
        store
            .set("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let remaining = store.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
        assert_eq!(store.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = MokaCacheStore::new(100);
        let ttl = Duration::from_secs(60);
        store.set("a", b"1".to_vec(), ttl).await.unwrap();
        store.set("b", b"2".to_vec(), ttl).await.unwrap();

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        store.clear().await.unwrap();
        assert_eq!(store.get("b").await.unwrap(), None);
    }
}
