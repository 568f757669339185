//! Cache storage.
//!
//! `CacheStore` is the only seam that talks to the backing key-value store.
//! `MemoryStore` is the in-process implementation; `BoundedStore` puts a
//! deadline on every round-trip of whatever store it wraps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;

use super::keys::CacheKey;

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub stored_at: OffsetDateTime,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    pub fn new(status: u16, content_type: Option<String>, body: Bytes, ttl: Duration) -> Self {
        Self {
            status,
            content_type,
            body,
            stored_at: OffsetDateTime::now_utc(),
            ttl_seconds: ttl.as_secs(),
        }
    }

    /// How long the entry has been stored, as seen at `now`.
    pub fn age_at(&self, now: OffsetDateTime) -> Duration {
        let elapsed = now - self.stored_at;
        Duration::try_from(elapsed).unwrap_or(Duration::ZERO)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store `{op}` timed out after {after_ms} ms")]
    Timeout { op: &'static str, after_ms: u64 },
    #[error("cache entry could not be encoded: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Codec(_) => "codec",
        }
    }
}

/// Contract over a TTL-capable key-value store.
///
/// Any call may fail; callers on the request path treat failures as misses.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    async fn set_with_expiry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Keys matching a glob pattern (`*` any run of characters, `?` exactly one).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<CacheKey>, StoreError>;

    /// Delete `keys`, returning how many existed.
    async fn delete_many(&self, keys: &[CacheKey]) -> Result<usize, StoreError>;
}

// ============================================================================
// MemoryStore
// ============================================================================

struct Slot {
    entry: CacheEntry,
    expires_at: Instant,
}

/// In-process TTL store. Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.slots.len())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .iter()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let now = Instant::now();
        if let Some(slot) = self.slots.get(key.as_str()) {
            if slot.expires_at > now {
                return Ok(Some(slot.entry.clone()));
            }
        }
        self.slots
            .remove_if(key.as_str(), |_, slot| slot.expires_at <= now);
        Ok(None)
    }

    async fn set_with_expiry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if ttl.is_zero() {
            self.slots.remove(key.as_str());
            return Ok(());
        }
        let slot = Slot {
            entry,
            expires_at: Instant::now() + ttl,
        };
        self.slots.insert(key.as_str().to_string(), slot);
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<CacheKey>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|slot| slot.expires_at > now && glob_match(pattern, slot.key()))
            .map(|slot| CacheKey::from_raw(slot.key().clone()))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_many(&self, keys: &[CacheKey]) -> Result<usize, StoreError> {
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|key| self.slots.remove(key.as_str()))
            .filter(|(_, slot)| slot.expires_at > now)
            .count())
    }
}

// ============================================================================
// BoundedStore
// ============================================================================

/// Applies one deadline to every operation of the wrapped store.
#[derive(Clone)]
pub struct BoundedStore {
    inner: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl BoundedStore {
    pub fn new(inner: Arc<dyn CacheStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn deadline<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[async_trait]
impl CacheStore for BoundedStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.deadline("get", self.inner.get(key)).await
    }

    async fn set_with_expiry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.deadline("set_with_expiry", self.inner.set_with_expiry(key, entry, ttl))
            .await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<CacheKey>, StoreError> {
        self.deadline("keys_matching", self.inner.keys_matching(pattern))
            .await
    }

    async fn delete_many(&self, keys: &[CacheKey]) -> Result<usize, StoreError> {
        self.deadline("delete_many", self.inner.delete_many(keys))
            .await
    }
}

/// Redis-style glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}
