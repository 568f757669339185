//! Efficiency monitor.
//!
//! Aggregates hit, miss, store and invalidation counts per resource type and
//! turns them into reports that feed TTL auto-tuning. Recording is lock-free on
//! the request path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::keys::ResourceType;
use super::lock::{rw_read, rw_write};
use super::serialize_rfc3339;
use super::store::CacheStore;

const SOURCE: &str = "cache::monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Ok,
    NoData,
    Disabled,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoData => "no_data",
            Self::Disabled => "disabled",
        }
    }
}

/// Aggregates for one resource type.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResourceEfficiency {
    /// hits / (hits + misses); 0 without lookups.
    pub hit_ratio: f64,
    /// Mean TTL assigned to stored entries.
    pub avg_entry_lifetime_secs: f64,
    /// Lookups (hits + misses).
    pub sample_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub store_errors: u64,
    /// invalidations / stores.
    pub churn: f64,
    /// Live keys in the store, when a cross-check ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_entries: Option<usize>,
}

/// Point-in-time efficiency aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EfficiencyReport {
    #[serde(serialize_with = "serialize_rfc3339")]
    pub generated_at: OffsetDateTime,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub since: OffsetDateTime,
    pub status: ReportStatus,
    pub per_resource_type: BTreeMap<String, ResourceEfficiency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EfficiencyReport {
    pub fn empty(status: ReportStatus) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            generated_at: now,
            since: now,
            status,
            per_resource_type: BTreeMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatus {
    pub enabled: bool,
    pub sample_rate: f64,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub since: OffsetDateTime,
    pub tracked_resource_types: usize,
}

#[derive(Clone, Copy)]
enum EventKind {
    Hit,
    Miss,
    Bypass,
    Store,
    Invalidation,
    StoreError,
}

const EVENT_KINDS: usize = 6;

#[derive(Default)]
struct Counters {
    /// Sampling sequence per event kind.
    sequences: [AtomicU64; EVENT_KINDS],
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    stores: AtomicU64,
    ttl_seconds_total: AtomicU64,
    invalidations: AtomicU64,
    store_errors: AtomicU64,
}

impl Counters {
    fn to_efficiency(&self) -> ResourceEfficiency {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let (hits, misses, stores) = (load(&self.hits), load(&self.misses), load(&self.stores));
        let invalidations = load(&self.invalidations);
        let sample_count = hits + misses;

        ResourceEfficiency {
            hit_ratio: ratio(hits, sample_count),
            avg_entry_lifetime_secs: ratio(load(&self.ttl_seconds_total), stores),
            sample_count,
            hits,
            misses,
            bypasses: load(&self.bypasses),
            stores,
            invalidations,
            store_errors: load(&self.store_errors),
            churn: ratio(invalidations, stores),
            live_entries: None,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Per-resource-type efficiency counters.
pub struct EfficiencyMonitor {
    enabled: bool,
    sample_rate: f64,
    counters: DashMap<ResourceType, Counters>,
    since: RwLock<OffsetDateTime>,
    store: Option<Arc<dyn CacheStore>>,
}

impl EfficiencyMonitor {
    /// `store` enables the live-entry cross-check in reports.
    pub fn new(config: &CacheConfig, store: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            enabled: config.enable_monitoring,
            sample_rate: config.monitor_sample_rate,
            counters: DashMap::new(),
            since: RwLock::new(OffsetDateTime::now_utc()),
            store,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_hit(&self, resource_type: &ResourceType) {
        self.record(resource_type, EventKind::Hit, |counters| {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_miss(&self, resource_type: &ResourceType) {
        self.record(resource_type, EventKind::Miss, |counters| {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_bypass(&self, resource_type: &ResourceType) {
        self.record(resource_type, EventKind::Bypass, |counters| {
            counters.bypasses.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_store(&self, resource_type: &ResourceType, ttl: Duration) {
        self.record(resource_type, EventKind::Store, |counters| {
            counters.stores.fetch_add(1, Ordering::Relaxed);
            counters
                .ttl_seconds_total
                .fetch_add(ttl.as_secs(), Ordering::Relaxed);
        });
    }

    pub fn record_invalidation(&self, resource_type: &ResourceType) {
        self.record(resource_type, EventKind::Invalidation, |counters| {
            counters.invalidations.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_store_error(&self, resource_type: &ResourceType) {
        self.record(resource_type, EventKind::StoreError, |counters| {
            counters.store_errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn record(
        &self,
        resource_type: &ResourceType,
        kind: EventKind,
        apply: impl FnOnce(&Counters),
    ) {
        if !self.enabled || self.sample_rate <= 0.0 {
            return;
        }
        if let Some(counters) = self.counters.get(resource_type) {
            if self.sampled(&counters, kind) {
                apply(&counters);
            }
            return;
        }
        let counters = self.counters.entry(resource_type.clone()).or_default();
        if self.sampled(&counters, kind) {
            apply(&counters);
        }
    }

    /// The `n`th event of a kind is kept when `floor((n+1)·r) > floor(n·r)`,
    /// so exactly `floor(N·r)` of the first `N` events of each kind are recorded.
    fn sampled(&self, counters: &Counters, kind: EventKind) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        let n = counters.sequences[kind as usize].fetch_add(1, Ordering::Relaxed) as f64;
        ((n + 1.0) * self.sample_rate).floor() > (n * self.sample_rate).floor()
    }

    /// Aggregate everything recorded since startup or the last reset.
    pub async fn generate_report(&self) -> EfficiencyReport {
        let since = *rw_read(&self.since, SOURCE, "generate_report");
        let mut report = EfficiencyReport {
            since,
            ..EfficiencyReport::empty(ReportStatus::NoData)
        };

        if !self.enabled {
            report.status = ReportStatus::Disabled;
            report.error = Some("monitoring is disabled".to_string());
            return report;
        }

        // Snapshot before any await so no shard guard crosses a suspension point.
        let snapshot: Vec<(ResourceType, ResourceEfficiency)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_efficiency()))
            .collect();

        let has_samples = snapshot.iter().any(|(_, stats)| stats.sample_count > 0);
        report.status = if has_samples {
            ReportStatus::Ok
        } else {
            ReportStatus::NoData
        };

        for (resource_type, mut stats) in snapshot {
            if let Some(store) = &self.store {
                let pattern = format!("{resource_type}:*");
                match store.keys_matching(&pattern).await {
                    Ok(keys) => stats.live_entries = Some(keys.len()),
                    Err(err) => {
                        warn!(
                            resource_type = %resource_type,
                            error = %err,
                            "store cross-check failed"
                        );
                        report.error = Some(format!("store cross-check failed: {err}"));
                    }
                }
            }
            report
                .per_resource_type
                .insert(resource_type.to_string(), stats);
        }

        debug!(
            status = report.status.as_str(),
            resource_types = report.per_resource_type.len(),
            "efficiency report generated"
        );
        report
    }

    pub fn status(&self) -> MonitoringStatus {
        MonitoringStatus {
            enabled: self.enabled,
            sample_rate: self.sample_rate,
            since: *rw_read(&self.since, SOURCE, "status"),
            tracked_resource_types: self.counters.len(),
        }
    }

    /// Zero every counter and restart the reporting window.
    pub fn reset(&self) {
        self.counters.clear();
        *rw_write(&self.since, SOURCE, "reset") = OffsetDateTime::now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::super::keys::CacheKey;
    use super::super::store::{CacheEntry, MemoryStore};
    use super::*;

    fn monitor_with(config: CacheConfig) -> EfficiencyMonitor {
        EfficiencyMonitor::new(&config.sanitized(), None)
    }

    #[tokio::test]
    async fn empty_monitor_reports_no_data() {
        let monitor = monitor_with(CacheConfig::default());
        let report = monitor.generate_report().await;
        assert_eq!(report.status, ReportStatus::NoData);
        assert!(report.per_resource_type.is_empty());
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn report_aggregates_ratios() {
        let monitor = monitor_with(CacheConfig::default());
        let rt = ResourceType::new("widget");
        for _ in 0..3 {
            monitor.record_hit(&rt);
        }
        monitor.record_miss(&rt);
        monitor.record_store(&rt, Duration::from_secs(100));
        monitor.record_store(&rt, Duration::from_secs(300));
        monitor.record_invalidation(&rt);

        let report = monitor.generate_report().await;
        assert_eq!(report.status, ReportStatus::Ok);
        let stats = &report.per_resource_type["widget"];
        assert_eq!(stats.sample_count, 4);
        assert_eq!(stats.hit_ratio, 0.75);
        assert_eq!(stats.avg_entry_lifetime_secs, 200.0);
        assert_eq!(stats.churn, 0.5);
    }

    #[tokio::test]
    async fn disabled_monitor_reports_an_error_field() {
        let monitor = monitor_with(CacheConfig {
            enable_monitoring: false,
            ..Default::default()
        });
        monitor.record_hit(&ResourceType::new("widget"));

        let report = monitor.generate_report().await;
        assert_eq!(report.status, ReportStatus::Disabled);
        assert!(report.error.is_some());
        assert!(!monitor.status().enabled);
    }

    #[test]
    fn sampling_keeps_floor_of_rate_times_events() {
        let monitor = monitor_with(CacheConfig {
            monitor_sample_rate: 0.25,
            ..Default::default()
        });
        let rt = ResourceType::new("widget");
        for _ in 0..100 {
            monitor.record_hit(&rt);
        }
        let hits = monitor
            .counters
            .get(&rt)
            .map(|counters| counters.hits.load(Ordering::Relaxed));
        assert_eq!(hits, Some(25));
    }

    #[tokio::test]
    async fn interleaved_events_are_sampled_per_kind() {
        let monitor = monitor_with(CacheConfig {
            monitor_sample_rate: 0.5,
            ..Default::default()
        });
        let rt = ResourceType::new("widget");
        for _ in 0..10 {
            monitor.record_miss(&rt);
            monitor.record_store(&rt, Duration::from_secs(60));
        }
        for _ in 0..10 {
            monitor.record_hit(&rt);
        }

        let report = monitor.generate_report().await;
        let stats = &report.per_resource_type["widget"];
        assert_eq!(stats.misses, 5);
        assert_eq!(stats.stores, 5);
        assert_eq!(stats.hits, 5);
        assert_eq!(stats.hit_ratio, 0.5);
    }

    #[tokio::test]
    async fn reset_clears_counters_and_moves_window() {
        let monitor = monitor_with(CacheConfig::default());
        let before = monitor.status().since;
        monitor.record_miss(&ResourceType::new("widget"));
        monitor.reset();

        assert_eq!(monitor.generate_report().await.status, ReportStatus::NoData);
        assert!(monitor.status().since >= before);
    }

    #[tokio::test]
    async fn cross_check_counts_live_keys() {
        let store = Arc::new(MemoryStore::new());
        for raw in ["widget:1", "widget:2"] {
            store
                .set_with_expiry(
                    &CacheKey::from_raw(raw),
                    CacheEntry::new(200, None, bytes::Bytes::new(), Duration::from_secs(60)),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }
        let monitor = EfficiencyMonitor::new(&CacheConfig::default(), Some(store as Arc<dyn CacheStore>));
        monitor.record_hit(&ResourceType::new("widget"));

        let report = monitor.generate_report().await;
        assert_eq!(report.per_resource_type["widget"].live_entries, Some(2));
    }
}
