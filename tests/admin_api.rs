//! Admin router exercised in-process with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use respcache::cache::{
    CacheConfig, CacheMaintenance, CacheStore, HandlerResponse, MemoryStore, RequestDescriptor,
    ResourceType, ResponseCache, StoreError,
};
use respcache::infra::http::{AdminState, build_admin_router};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
    router: Router,
    cache: Arc<ResponseCache>,
    store: Arc<MemoryStore>,
}

fn harness(config: CacheConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(ResponseCache::new(config, store.clone() as Arc<dyn CacheStore>));
    let maintenance = Arc::new(CacheMaintenance::new(Arc::clone(&cache)));
    Harness {
        router: build_admin_router(AdminState::new(maintenance)),
        cache,
        store,
    }
}

async fn call(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn populate(cache: &ResponseCache, store: &MemoryStore, ids: &[u32]) {
    let resource = ResourceType::new("widget");
    for id in ids {
        let request = RequestDescriptor::new("GET", format!("/widget/{id}"));
        cache
            .intercept(&resource, &request, || async move {
                Ok::<_, StoreError>(HandlerResponse::json(200, &json!({"id": id})))
            })
            .await
            .unwrap();
    }
    for _ in 0..100 {
        if store.len() == ids.len() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("entries were not stored");
}

#[tokio::test]
async fn health_is_no_content() {
    let h = harness(CacheConfig::default());
    let (status, body) = call(&h.router, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn invalidate_requires_a_pattern() {
    let h = harness(CacheConfig::default());
    let (status, body) = call(&h.router, Method::POST, "/cache/invalidate").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = call(&h.router, Method::POST, "/cache/invalidate?pattern=%20").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalidate_deletes_matching_entries() {
    let h = harness(CacheConfig::default());
    populate(&h.cache, &h.store, &[1, 2]).await;

    let (status, body) = call(&h.router, Method::POST, "/cache/invalidate?pattern=widget:*").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);
    assert!(h.store.is_empty());

    let (status, body) = call(&h.router, Method::POST, "/cache/invalidate?pattern=widget:*").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 0);
}

#[tokio::test]
async fn top_and_reset_reflect_tracker_state() {
    let h = harness(CacheConfig::default());
    populate(&h.cache, &h.store, &[1]).await;

    let (status, body) = call(&h.router, Method::GET, "/cache/top?min_hits=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tracked"], 1);
    assert_eq!(body["items"][0]["hit_count"], 1);
    assert_eq!(body["items"][0]["resource_type"], "widget");

    let (_, body) = call(&h.router, Method::GET, "/cache/top").await;
    assert_eq!(body["items"], json!([]));

    let (status, body) = call(&h.router, Method::POST, "/cache/tracker/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 1);
    assert!(h.cache.tracker().is_empty());
}

#[tokio::test]
async fn warm_reports_cycle_or_disabled() {
    let h = harness(CacheConfig::default());
    let (status, body) = call(&h.router, Method::POST, "/cache/warm").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert!(body["cycle_id"].is_string());

    let disabled = harness(CacheConfig {
        enable_warming: false,
        ..Default::default()
    });
    let (status, body) = call(&disabled.router, Method::POST, "/cache/warm").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "feature_disabled");
}

#[tokio::test]
async fn ttl_endpoints_expose_and_reset_weights() {
    let h = harness(CacheConfig::default());

    let (status, body) = call(&h.router, Method::GET, "/ttl/weights").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["frequency"], 0.5);

    let (status, body) = call(&h.router, Method::POST, "/ttl/autotune").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"]["success"], false);

    let (status, body) = call(&h.router, Method::POST, "/ttl/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recency"], 0.3);
}

#[tokio::test]
async fn ttl_compute_validates_and_reports_tracking() {
    let h = harness(CacheConfig::default());

    let (status, _) = call(&h.router, Method::GET, "/ttl/compute").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&h.router, Method::GET, "/ttl/compute?resource_type=sentiment").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tracked"], false);
    let ttl = body["ttl_secs"].as_u64().unwrap();
    assert!((300..=86_400).contains(&ttl));

    populate(&h.cache, &h.store, &[5]).await;
    let key = h.cache.tracker().top_resources(1, 1)[0].key.clone();
    let uri = format!("/ttl/compute?resource_type=widget&key={}", key.as_str());
    let (status, body) = call(&h.router, Method::GET, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tracked"], true);
    assert_eq!(body["key"], key.as_str());
}

#[tokio::test]
async fn efficiency_endpoints_report_activity() {
    let h = harness(CacheConfig {
        monitor_sample_rate: 1.0,
        ..Default::default()
    });

    let (status, body) = call(&h.router, Method::GET, "/efficiency/report").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "no_data");

    populate(&h.cache, &h.store, &[1]).await;
    let (_, body) = call(&h.router, Method::GET, "/efficiency/report").await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["per_resource_type"]["widget"]["misses"], 1);

    let (status, body) = call(&h.router, Method::GET, "/efficiency/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["tracked_resource_types"], 1);
}
