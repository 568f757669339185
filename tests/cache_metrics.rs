use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use respcache::cache::{
    CacheConfig, CacheEntry, CacheKey, CacheMaintenance, CacheStore, CycleOutcome,
    HandlerResponse, MemoryStore, RecomputeError, RequestDescriptor, ResourceType, ResponseCache,
    StoreError, recompute_fn,
};
use respcache::infra::telemetry;
use serial_test::serial;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

fn metric_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

struct DownStore;

#[async_trait]
impl CacheStore for DownStore {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn set_with_expiry(
        &self,
        _key: &CacheKey,
        _entry: CacheEntry,
        _ttl: std::time::Duration,
    ) -> Result<(), StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn keys_matching(&self, _pattern: &str) -> Result<Vec<CacheKey>, StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn delete_many(&self, _keys: &[CacheKey]) -> Result<usize, StoreError> {
        Err(StoreError::unavailable("down"))
    }
}

#[tokio::test]
#[serial]
async fn request_path_emits_outcome_counters() {
    snapshotter();
    let resource = ResourceType::new("widget");
    let handler = || async { Ok::<_, StoreError>(HandlerResponse::new(200, "ok")) };

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let cache = ResponseCache::new(CacheConfig::default(), store);
    let request = RequestDescriptor::new("GET", "/widget/1");
    cache.intercept(&resource, &request, handler).await.unwrap();
    for _ in 0..100 {
        let hit = cache.intercept(&resource, &request, handler).await.unwrap();
        if hit.outcome.as_str() == "hit" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cache
        .intercept(&resource, &request.clone().with_query("nocache", "1"), handler)
        .await
        .unwrap();

    let down = ResponseCache::new(CacheConfig::default(), Arc::new(DownStore));
    down.intercept(&resource, &request, handler).await.unwrap();

    let names = metric_names();
    for metric in [
        "respcache_cache_hit_total",
        "respcache_cache_miss_total",
        "respcache_cache_bypass_total",
        "respcache_cache_store_error_total",
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn warm_cycle_emits_latency_and_count() {
    snapshotter();
    let config = CacheConfig {
        warm_min_hits: 1,
        tracker_capacity: 1,
        ..Default::default()
    };
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let cache = Arc::new(ResponseCache::new(config, store));
    let resource = ResourceType::new("widget");

    cache.tracker().track_access(&resource, &CacheKey::from_raw("widget:evicted"), None);
    cache.tracker().track_access(
        &resource,
        &CacheKey::from_raw("widget:kept"),
        Some(recompute_fn(|| async {
            Ok::<_, RecomputeError>(Some(HandlerResponse::new(200, "warm")))
        })),
    );

    let maintenance = CacheMaintenance::new(cache);
    let CycleOutcome::Completed(Some(report)) = maintenance.warm_once().await else {
        panic!("warming is enabled");
    };
    assert_eq!(report.warmed, 1);

    let names = metric_names();
    for metric in [
        "respcache_tracker_evict_total",
        "respcache_warm_ms",
        "respcache_warmed_total",
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
