//! Access tracking and proactive warming.
//!
//! Every cache lookup bumps a record in a bounded LRU index. Warm cycles pick
//! the hottest records and re-run their recompute capability so popular
//! entries are refreshed before they expire cold.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream};
use lru::LruCache;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::keys::{CacheKey, ResourceType};
use super::lock::mutex_lock;
use super::middleware::{CacheableResponse, HandlerResponse};
use super::serialize_rfc3339;
use super::store::CacheStore;

const SOURCE: &str = "cache::tracker";
const METRIC_EVICT: &str = "respcache_tracker_evict_total";
const METRIC_WARM_MS: &str = "respcache_warm_ms";
const METRIC_WARMED: &str = "respcache_warmed_total";

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error("recompute failed: {0}")]
    Failed(String),
    #[error("recompute timed out after {0} ms")]
    TimedOut(u64),
}

impl RecomputeError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Re-runs the computation behind a cached entry.
///
/// `Ok(None)` means there is nothing to cache right now.
#[async_trait]
pub trait Recompute: Send + Sync {
    async fn recompute(&self) -> Result<Option<HandlerResponse>, RecomputeError>;
}

/// Adapter turning an async closure into a `Recompute`.
pub struct RecomputeFn<F>(F);

#[async_trait]
impl<F, Fut> Recompute for RecomputeFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<HandlerResponse>, RecomputeError>> + Send,
{
    async fn recompute(&self) -> Result<Option<HandlerResponse>, RecomputeError> {
        (self.0)().await
    }
}

pub fn recompute_fn<F, Fut>(f: F) -> Arc<dyn Recompute>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<HandlerResponse>, RecomputeError>> + Send + 'static,
{
    Arc::new(RecomputeFn(f))
}

/// One tracked `(resource_type, key)` pair.
#[derive(Clone)]
pub struct AccessRecord {
    pub resource_type: ResourceType,
    pub key: CacheKey,
    pub hit_count: u64,
    pub last_access: OffsetDateTime,
    pub recompute: Option<Arc<dyn Recompute>>,
}

impl fmt::Debug for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRecord")
            .field("resource_type", &self.resource_type)
            .field("key", &self.key)
            .field("hit_count", &self.hit_count)
            .field("last_access", &self.last_access)
            .field("has_recompute", &self.recompute.is_some())
            .finish()
    }
}

#[derive(Serialize)]
struct AccessView<'a> {
    resource_type: &'a ResourceType,
    key: &'a CacheKey,
    hit_count: u64,
    #[serde(serialize_with = "serialize_rfc3339")]
    last_access: OffsetDateTime,
    has_recompute: bool,
}

impl Serialize for AccessRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AccessView {
            resource_type: &self.resource_type,
            key: &self.key,
            hit_count: self.hit_count,
            last_access: self.last_access,
            has_recompute: self.recompute.is_some(),
        }
        .serialize(serializer)
    }
}

/// Summary of one warm cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub cycle_id: Uuid,
    /// Records selected for warming.
    pub total: usize,
    pub warmed: usize,
    /// Recompute returned nothing to cache.
    pub empty: usize,
    pub failed: usize,
    pub missing_recompute: usize,
    pub duration_ms: u64,
}

enum WarmResult {
    Warmed,
    Empty,
    Failed,
    MissingRecompute,
}

type TrackerKey = (ResourceType, CacheKey);

/// Bounded LRU index of access records.
pub struct AccessTracker {
    config: Arc<CacheConfig>,
    records: Mutex<LruCache<TrackerKey, AccessRecord>>,
}

impl AccessTracker {
    pub fn new(config: Arc<CacheConfig>) -> Self {
        let capacity = config.tracker_capacity_non_zero();
        Self {
            config,
            records: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enable_warming
    }

    /// Count one access. Returns the updated record, or `None` when warming is disabled.
    pub fn track_access(
        &self,
        resource_type: &ResourceType,
        key: &CacheKey,
        recompute: Option<Arc<dyn Recompute>>,
    ) -> Option<AccessRecord> {
        if !self.enabled() {
            return None;
        }

        let now = OffsetDateTime::now_utc();
        let mut records = mutex_lock(&self.records, SOURCE, "track_access");
        let tracker_key = (resource_type.clone(), key.clone());

        if let Some(record) = records.get_mut(&tracker_key) {
            record.hit_count = record.hit_count.saturating_add(1);
            record.last_access = now;
            if recompute.is_some() {
                record.recompute = recompute;
            }
            return Some(record.clone());
        }

        let record = AccessRecord {
            resource_type: resource_type.clone(),
            key: key.clone(),
            hit_count: 1,
            last_access: now,
            recompute,
        };
        if let Some((evicted, _)) = records.push(tracker_key, record.clone()) {
            // `push` also returns the old value on a same-key replace, which cannot happen here.
            debug!(resource_type = %evicted.0, key = %evicted.1, "access record evicted");
            counter!(METRIC_EVICT).increment(1);
        }
        Some(record)
    }

    /// Up to `max_items` records with at least `min_hits`, hottest first.
    pub fn top_resources(&self, max_items: usize, min_hits: u64) -> Vec<AccessRecord> {
        let mut candidates: Vec<AccessRecord> = {
            let records = mutex_lock(&self.records, SOURCE, "top_resources");
            records
                .iter()
                .filter(|(_, record)| record.hit_count >= min_hits)
                .map(|(_, record)| record.clone())
                .collect()
        };

        candidates.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| b.last_access.cmp(&a.last_access))
        });
        candidates.truncate(max_items);
        candidates
    }

    /// Copy of one record without touching its LRU position.
    pub fn snapshot(&self, resource_type: &ResourceType, key: &CacheKey) -> Option<AccessRecord> {
        let records = mutex_lock(&self.records, SOURCE, "snapshot");
        records
            .peek(&(resource_type.clone(), key.clone()))
            .cloned()
    }

    /// Scale every hit count by `factor` (floored); records reaching zero are dropped.
    pub fn decay(&self, factor: f64) -> usize {
        let factor = if factor.is_finite() {
            factor.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let mut records = mutex_lock(&self.records, SOURCE, "decay");

        let mut emptied = Vec::new();
        for (tracker_key, record) in records.iter_mut() {
            // u64 -> f64 loses precision only above 2^53 hits.
            record.hit_count = (record.hit_count as f64 * factor).floor() as u64;
            if record.hit_count == 0 {
                emptied.push(tracker_key.clone());
            }
        }
        for tracker_key in &emptied {
            records.pop(tracker_key);
        }
        emptied.len()
    }

    pub fn reset(&self) {
        mutex_lock(&self.records, SOURCE, "reset").clear();
        info!("access tracker reset");
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-run recomputes for the hottest records and write fresh entries.
    ///
    /// Returns `None` when warming is disabled. Failures are counted per record
    /// and never abort the batch.
    pub async fn warm_cache(&self, store: &dyn CacheStore) -> Option<WarmReport> {
        if !self.enabled() {
            return None;
        }

        let cycle_id = Uuid::new_v4();
        let started = Instant::now();
        let candidates = self.top_resources(self.config.warm_max_items, self.config.warm_min_hits);
        let total = candidates.len();

        let results: Vec<WarmResult> = stream::iter(candidates)
            .map(|record| self.warm_one(store, record))
            .buffer_unordered(self.config.warm_concurrency.max(1))
            .collect()
            .await;

        let mut report = WarmReport {
            cycle_id,
            total,
            warmed: 0,
            empty: 0,
            failed: 0,
            missing_recompute: 0,
            duration_ms: 0,
        };
        for result in results {
            match result {
                WarmResult::Warmed => report.warmed += 1,
                WarmResult::Empty => report.empty += 1,
                WarmResult::Failed => report.failed += 1,
                WarmResult::MissingRecompute => report.missing_recompute += 1,
            }
        }

        let elapsed = started.elapsed();
        report.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        histogram!(METRIC_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);
        counter!(METRIC_WARMED).increment(report.warmed as u64);

        info!(
            cycle_id = %cycle_id,
            total = report.total,
            warmed = report.warmed,
            empty = report.empty,
            failed = report.failed,
            missing_recompute = report.missing_recompute,
            elapsed_ms = report.duration_ms,
            "warm cycle completed"
        );

        Some(report)
    }

    async fn warm_one(&self, store: &dyn CacheStore, record: AccessRecord) -> WarmResult {
        let Some(recompute) = record.recompute.clone() else {
            debug!(key = %record.key, "no recompute registered, skipping");
            return WarmResult::MissingRecompute;
        };

        let timeout = self.config.recompute_timeout();
        let call = AssertUnwindSafe(recompute.recompute()).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(RecomputeError::failed("recompute panicked")),
            Err(_) => Err(RecomputeError::TimedOut(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        let response = match outcome {
            Ok(Some(response)) => response,
            Ok(None) => return WarmResult::Empty,
            Err(err) => {
                warn!(key = %record.key, error = %err, "recompute failed during warming");
                return WarmResult::Failed;
            }
        };

        if !response.is_success() {
            debug!(key = %record.key, status = response.status, "recompute returned non-success");
            return WarmResult::Failed;
        }

        let ttl = self.config.policy_for(&record.resource_type).default_ttl();
        let Some(entry) = response.to_entry(ttl) else {
            return WarmResult::Empty;
        };

        match store.set_with_expiry(&record.key, entry, ttl).await {
            Ok(()) => WarmResult::Warmed,
            Err(err) => {
                warn!(
                    key = %record.key,
                    error_kind = err.kind(),
                    error = %err,
                    "failed to write warmed entry"
                );
                WarmResult::Failed
            }
        }
    }
}
