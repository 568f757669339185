//! Response cache middleware.
//!
//! `ResponseCache::intercept` sits between a caller and its real handler: it
//! serves hits from the store, runs the handler on misses, and stores 2xx
//! results in a detached task. The store can fail at any point; every failure
//! degrades to a miss so a request never fails because of the cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::config::CacheConfig;
use super::keys::{CacheKey, RequestDescriptor, ResourceType, generate_key_with_fields};
use super::monitor::EfficiencyMonitor;
use super::store::{BoundedStore, CacheEntry, CacheStore, StoreError};
use super::tracker::{AccessRecord, AccessTracker, Recompute};
use super::ttl::AdaptiveTtl;

const METRIC_HIT: &str = "respcache_cache_hit_total";
const METRIC_MISS: &str = "respcache_cache_miss_total";
const METRIC_BYPASS: &str = "respcache_cache_bypass_total";
const METRIC_STORE_ERROR: &str = "respcache_cache_store_error_total";

/// A response the cache can capture on a miss and rebuild on a hit.
pub trait CacheableResponse: Sized {
    fn status(&self) -> u16;

    /// Entry to store under `ttl`, or `None` when this response must not be cached.
    fn to_entry(&self, ttl: Duration) -> Option<CacheEntry>;

    fn from_entry(entry: CacheEntry) -> Self;
}

/// Plain `{status, body}` result of a handler or recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Never store this response even if it succeeded.
    pub no_store: bool,
}

impl HandlerResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
            no_store: false,
        }
    }

    /// JSON body with an `application/json` content type.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::new(status, value.to_string())
        }
    }

    pub fn no_store(mut self) -> Self {
        self.no_store = true;
        self
    }

    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }

    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl CacheableResponse for HandlerResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn to_entry(&self, ttl: Duration) -> Option<CacheEntry> {
        (!self.no_store).then(|| {
            CacheEntry::new(
                self.status,
                self.content_type.clone(),
                self.body.clone(),
                ttl,
            )
        })
    }

    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            status: entry.status,
            content_type: entry.content_type,
            body: entry.body,
            no_store: false,
        }
    }
}

/// How a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass(BypassReason),
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Bypass(_) => "bypass",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    Disabled,
    Method,
    Header,
    QueryParam,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Method => "method",
            Self::Header => "header",
            Self::QueryParam => "query_param",
        }
    }
}

/// Result of `intercept`: the response plus how it was produced.
#[derive(Debug)]
pub struct Intercepted<R> {
    pub response: R,
    pub outcome: CacheOutcome,
    /// Fingerprint used for the lookup; `None` on bypass.
    pub key: Option<CacheKey>,
}

/// Shared response cache: store, access tracker, TTL engine and monitor.
pub struct ResponseCache {
    config: Arc<CacheConfig>,
    store: Arc<dyn CacheStore>,
    tracker: Arc<AccessTracker>,
    ttl: Arc<AdaptiveTtl>,
    monitor: Arc<EfficiencyMonitor>,
}

impl ResponseCache {
    /// Build every component from `config`. The store is wrapped with the configured deadline.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        let config = Arc::new(config.sanitized());
        let store: Arc<dyn CacheStore> =
            Arc::new(BoundedStore::new(store, config.store_timeout()));
        let tracker = Arc::new(AccessTracker::new(Arc::clone(&config)));
        let ttl = Arc::new(AdaptiveTtl::new(Arc::clone(&config)));
        let monitor = Arc::new(EfficiencyMonitor::new(
            &config,
            Some(Arc::clone(&store)),
        ));
        Self::from_parts(config, store, tracker, ttl, monitor)
    }

    /// Assemble from pre-built components, e.g. to share one TTL engine across caches.
    pub fn from_parts(
        config: Arc<CacheConfig>,
        store: Arc<dyn CacheStore>,
        tracker: Arc<AccessTracker>,
        ttl: Arc<AdaptiveTtl>,
        monitor: Arc<EfficiencyMonitor>,
    ) -> Self {
        Self {
            config,
            store,
            tracker,
            ttl,
            monitor,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<AccessTracker> {
        &self.tracker
    }

    pub fn ttl(&self) -> &Arc<AdaptiveTtl> {
        &self.ttl
    }

    pub fn monitor(&self) -> &Arc<EfficiencyMonitor> {
        &self.monitor
    }

    /// Why `request` must skip the cache, if it must.
    pub fn bypass_reason(&self, request: &RequestDescriptor) -> Option<BypassReason> {
        if !self.config.enable_response_cache {
            Some(BypassReason::Disabled)
        } else if !self.config.is_cacheable_method(&request.method) {
            Some(BypassReason::Method)
        } else if request.has_header(&self.config.bypass_header) {
            Some(BypassReason::Header)
        } else if request.has_query_param(&self.config.bypass_query_param) {
            Some(BypassReason::QueryParam)
        } else {
            None
        }
    }

    /// Serve `request` from the cache or run `proceed` and capture its result.
    pub async fn intercept<R, F, Fut, E>(
        &self,
        resource_type: &ResourceType,
        request: &RequestDescriptor,
        proceed: F,
    ) -> Result<Intercepted<R>, E>
    where
        R: CacheableResponse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        self.intercept_with_recompute(resource_type, request, None, proceed)
            .await
    }

    /// Like `intercept`, also registering how to recompute this entry for warming.
    #[instrument(skip_all, fields(resource_type = %resource_type, path = %request.path))]
    pub async fn intercept_with_recompute<R, F, Fut, E>(
        &self,
        resource_type: &ResourceType,
        request: &RequestDescriptor,
        recompute: Option<Arc<dyn Recompute>>,
        proceed: F,
    ) -> Result<Intercepted<R>, E>
    where
        R: CacheableResponse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if let Some(reason) = self.bypass_reason(request) {
            debug!(cache = "response", outcome = "bypass", reason = reason.as_str());
            counter!(METRIC_BYPASS, "reason" => reason.as_str()).increment(1);
            self.monitor.record_bypass(resource_type);
            let response = proceed().await?;
            return Ok(Intercepted {
                response,
                outcome: CacheOutcome::Bypass(reason),
                key: None,
            });
        }

        let policy = self.config.policy_for(resource_type);
        let key = generate_key_with_fields(request, resource_type, policy.key_fields.as_deref());

        match self.store.get(&key).await {
            Ok(Some(entry)) => {
                debug!(cache = "response", outcome = "hit", key = %key);
                counter!(METRIC_HIT, "resource_type" => resource_type.to_string()).increment(1);
                self.tracker.track_access(resource_type, &key, recompute);
                self.monitor.record_hit(resource_type);
                return Ok(Intercepted {
                    response: R::from_entry(entry),
                    outcome: CacheOutcome::Hit,
                    key: Some(key),
                });
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    cache = "response",
                    op = "get",
                    error_kind = err.kind(),
                    error = %err,
                    key = %key,
                    "cache lookup failed, treating as miss"
                );
                counter!(METRIC_STORE_ERROR, "op" => "get").increment(1);
                self.monitor.record_store_error(resource_type);
            }
        }

        debug!(cache = "response", outcome = "miss", key = %key, "executing handler");
        counter!(METRIC_MISS, "resource_type" => resource_type.to_string()).increment(1);
        self.monitor.record_miss(resource_type);

        let result = proceed().await;
        let record = self.tracker.track_access(resource_type, &key, recompute);
        let response = result?;

        if is_success(response.status()) {
            let ttl = self.ttl_for(resource_type, record.as_ref());
            if let Some(entry) = response.to_entry(ttl) {
                self.monitor.record_store(resource_type, ttl);
                self.spawn_store(resource_type, key.clone(), entry, ttl);
            }
        }

        Ok(Intercepted {
            response,
            outcome: CacheOutcome::Miss,
            key: Some(key),
        })
    }

    /// Delete every key matching `pattern`. Zero matches is `Ok(0)`.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, pattern: &str) -> Result<usize, StoreError> {
        let keys = self.store.keys_matching(pattern).await.inspect_err(|err| {
            counter!(METRIC_STORE_ERROR, "op" => "keys_matching").increment(1);
            warn!(error = %err, "invalidation scan failed");
        })?;
        if keys.is_empty() {
            debug!("no cache entries matched");
            return Ok(0);
        }

        let deleted = self.store.delete_many(&keys).await.inspect_err(|err| {
            counter!(METRIC_STORE_ERROR, "op" => "delete_many").increment(1);
            warn!(error = %err, matched = keys.len(), "invalidation delete failed");
        })?;

        for key in &keys {
            if let Some(resource_type) = key.resource_type() {
                self.monitor.record_invalidation(&resource_type);
            }
        }

        info!(matched = keys.len(), deleted, "cache entries invalidated");
        Ok(deleted)
    }

    /// TTL for a fresh entry: adaptive when enabled, the policy default otherwise.
    pub fn ttl_for(&self, resource_type: &ResourceType, record: Option<&AccessRecord>) -> Duration {
        if self.config.enable_adaptive_ttl {
            Duration::from_secs(self.ttl.compute_ttl(resource_type, record))
        } else {
            self.config.policy_for(resource_type).default_ttl()
        }
    }

    fn spawn_store(&self, resource_type: &ResourceType, key: CacheKey, entry: CacheEntry, ttl: Duration) {
        let store = Arc::clone(&self.store);
        let monitor = Arc::clone(&self.monitor);
        let resource_type = resource_type.clone();
        let span = info_span!("cache_store", key = %key, ttl_secs = ttl.as_secs());

        tokio::spawn(
            async move {
                match store.set_with_expiry(&key, entry, ttl).await {
                    Ok(()) => debug!(cache = "response", "response stored"),
                    Err(err) => {
                        warn!(
                            cache = "response",
                            op = "set_with_expiry",
                            error_kind = err.kind(),
                            error = %err,
                            "cache write failed, response served uncached"
                        );
                        counter!(METRIC_STORE_ERROR, "op" => "set_with_expiry").increment(1);
                        monitor.record_store_error(&resource_type);
                    }
                }
            }
            .instrument(span),
        );
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::super::store::MemoryStore;
    use super::*;

    fn cache_with(config: CacheConfig) -> (ResponseCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(config, store.clone() as Arc<dyn CacheStore>);
        (cache, store)
    }

    async fn settle(store: &MemoryStore) {
        for _ in 0..100 {
            if !store.is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn bypass_reasons_in_priority_order() {
        let (cache, _) = cache_with(CacheConfig::default());
        let get = RequestDescriptor::new("GET", "/widget/1");

        assert_eq!(cache.bypass_reason(&get), None);
        assert_eq!(
            cache.bypass_reason(&RequestDescriptor::new("POST", "/widget/1")),
            Some(BypassReason::Method)
        );
        assert_eq!(
            cache.bypass_reason(&get.clone().with_header("X-Cache-Bypass", "1")),
            Some(BypassReason::Header)
        );
        assert_eq!(
            cache.bypass_reason(&get.clone().with_query("nocache", "")),
            Some(BypassReason::QueryParam)
        );

        let (disabled, _) = cache_with(CacheConfig {
            enable_response_cache: false,
            ..Default::default()
        });
        assert_eq!(disabled.bypass_reason(&get), Some(BypassReason::Disabled));
    }

    #[tokio::test]
    async fn miss_then_hit_skips_handler() {
        let (cache, store) = cache_with(CacheConfig::default());
        let rt = ResourceType::new("widget");
        let request = RequestDescriptor::new("GET", "/widget/42");
        let calls = AtomicUsize::new(0);

        let proceed = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(HandlerResponse::json(200, &json!({"id": 42})))
        };

        let first = cache.intercept(&rt, &request, proceed).await.unwrap();
        assert_eq!(first.outcome, CacheOutcome::Miss);
        settle(&store).await;

        let second: Intercepted<HandlerResponse> = cache
            .intercept(&rt, &request, proceed)
            .await
            .unwrap();
        assert_eq!(second.outcome, CacheOutcome::Hit);
        assert_eq!(second.response.json_body::<serde_json::Value>().unwrap(), json!({"id": 42}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_responses_are_not_stored() {
        let (cache, store) = cache_with(CacheConfig::default());
        let rt = ResourceType::new("widget");
        let request = RequestDescriptor::new("GET", "/widget/500");

        let result = cache
            .intercept(&rt, &request, || async {
                Ok::<_, std::convert::Infallible>(HandlerResponse::new(500, "boom"))
            })
            .await
            .unwrap();
        assert_eq!(result.outcome, CacheOutcome::Miss);
        assert_eq!(result.response.status, 500);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn handler_errors_propagate_and_still_track() {
        let (cache, store) = cache_with(CacheConfig::default());
        let rt = ResourceType::new("widget");
        let request = RequestDescriptor::new("GET", "/widget/7");

        let err = cache
            .intercept::<HandlerResponse, _, _, _>(&rt, &request, || async { Err("upstream down") })
            .await
            .expect_err("handler error surfaces");
        assert_eq!(err, "upstream down");
        assert!(store.is_empty());
        assert_eq!(cache.tracker().len(), 1);
    }

    #[tokio::test]
    async fn no_store_responses_skip_the_store() {
        let (cache, store) = cache_with(CacheConfig::default());
        let rt = ResourceType::new("widget");
        let request = RequestDescriptor::new("GET", "/widget/private");

        cache
            .intercept(&rt, &request, || async {
                Ok::<_, std::convert::Infallible>(HandlerResponse::new(200, "secret").no_store())
            })
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn fixed_ttl_when_adaptive_disabled() {
        let (cache, _) = cache_with(CacheConfig {
            enable_adaptive_ttl: false,
            ..Default::default()
        });
        let ttl = cache.ttl_for(&ResourceType::new("sentiment"), None);
        assert_eq!(ttl, Duration::from_secs(3_600));
    }

    #[tokio::test]
    async fn invalidate_with_no_matches_is_ok() {
        let (cache, _) = cache_with(CacheConfig::default());
        assert_eq!(cache.invalidate("widget:*").await.unwrap(), 0);
    }
}
