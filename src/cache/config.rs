//! Cache configuration.
//!
//! Global toggles, request bypass rules, warming limits, TTL tuning knobs and
//! per-resource-type TTL policies. Loaded from the `[cache]` section of the
//! layered settings; every value is clamped into range instead of rejected.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::keys::ResourceType;

const DEFAULT_BYPASS_HEADER: &str = "x-cache-bypass";
const DEFAULT_BYPASS_QUERY_PARAM: &str = "nocache";
const DEFAULT_PRINCIPAL_HEADER: &str = "x-principal-id";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_BODY_LIMIT_BYTES: usize = 1024 * 1024;
const DEFAULT_TRACKER_CAPACITY: usize = 10_000;
const DEFAULT_WARM_MAX_ITEMS: usize = 50;
const DEFAULT_WARM_MIN_HITS: u64 = 3;
const DEFAULT_WARM_CONCURRENCY: usize = 4;
const DEFAULT_RECOMPUTE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DECAY_FACTOR: f64 = 0.5;
const DEFAULT_SAMPLE_RATE: f64 = 1.0;

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve and store responses at all.
    pub enable_response_cache: bool,
    /// Track accesses and run warm cycles.
    pub enable_warming: bool,
    /// Use the adaptive TTL engine; otherwise each resource's default TTL.
    pub enable_adaptive_ttl: bool,
    /// Aggregate efficiency counters.
    pub enable_monitoring: bool,
    /// Upper-case HTTP methods eligible for caching.
    pub cacheable_methods: Vec<String>,
    /// Presence of this header skips the cache.
    pub bypass_header: String,
    /// Presence of this query parameter skips the cache.
    pub bypass_query_param: String,
    /// Header the HTTP adapter reads the caller identity from.
    pub principal_header: String,
    /// Deadline for every store round-trip.
    pub store_timeout_ms: u64,
    /// Largest request or response body the HTTP adapter buffers.
    pub body_limit_bytes: usize,
    /// Maximum access records kept before LRU eviction.
    pub tracker_capacity: usize,
    /// Records considered per warm cycle.
    pub warm_max_items: usize,
    /// Minimum hit count for a record to be warmed.
    pub warm_min_hits: u64,
    /// Recomputes running at once during a warm cycle.
    pub warm_concurrency: usize,
    /// Deadline for a single recompute during warming.
    pub recompute_timeout_ms: u64,
    /// Hit counts are multiplied by this after each warm cycle (1.0 disables decay).
    pub decay_factor: f64,
    /// Fraction of events the efficiency monitor records.
    pub monitor_sample_rate: f64,
    /// Adaptive TTL tuning knobs.
    pub ttl: TtlTuning,
    /// Policy used by resource types without an explicit entry.
    pub default_policy: ResourcePolicy,
    /// Per-resource-type policies.
    pub resources: HashMap<String, ResourcePolicy>,
}

/// TTL bounds and volatility for one resource type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub default_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// 0.0 = never changes, 1.0 = changes constantly.
    pub volatility: f64,
    /// Query/body fields that participate in the fingerprint; `None` means all.
    pub key_fields: Option<Vec<String>>,
}

/// Knobs for the adaptive TTL engine and its auto-tune step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TtlTuning {
    /// Hit ratio below which recency is favored.
    pub target_hit_ratio: f64,
    /// Hit ratio above which frequency is favored (when churn is low).
    pub upper_hit_ratio: f64,
    /// Invalidations per store below which churn counts as low.
    pub churn_threshold: f64,
    /// Weight change per resource type per tuning step.
    pub step: f64,
    /// Samples a resource type needs before it influences tuning.
    pub min_samples: u64,
    /// Hit count at which the frequency signal saturates.
    pub frequency_saturation: u64,
    /// Seconds after which the recency signal halves.
    pub recency_half_life_secs: u64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// Persist weights here after tuning or reset; in-memory only when unset.
    pub weights_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_response_cache: true,
            enable_warming: true,
            enable_adaptive_ttl: true,
            enable_monitoring: true,
            cacheable_methods: vec!["GET".to_string()],
            bypass_header: DEFAULT_BYPASS_HEADER.to_string(),
            bypass_query_param: DEFAULT_BYPASS_QUERY_PARAM.to_string(),
            principal_header: DEFAULT_PRINCIPAL_HEADER.to_string(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
            tracker_capacity: DEFAULT_TRACKER_CAPACITY,
            warm_max_items: DEFAULT_WARM_MAX_ITEMS,
            warm_min_hits: DEFAULT_WARM_MIN_HITS,
            warm_concurrency: DEFAULT_WARM_CONCURRENCY,
            recompute_timeout_ms: DEFAULT_RECOMPUTE_TIMEOUT_MS,
            decay_factor: DEFAULT_DECAY_FACTOR,
            monitor_sample_rate: DEFAULT_SAMPLE_RATE,
            ttl: TtlTuning::default(),
            default_policy: ResourcePolicy::default(),
            resources: builtin_resources(),
        }
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            min_ttl_secs: 10,
            max_ttl_secs: 3_600,
            volatility: 0.5,
            key_fields: None,
        }
    }
}

impl Default for TtlTuning {
    fn default() -> Self {
        Self {
            target_hit_ratio: 0.6,
            upper_hit_ratio: 0.9,
            churn_threshold: 0.1,
            step: 0.05,
            min_samples: 20,
            frequency_saturation: 100,
            recency_half_life_secs: 300,
            min_multiplier: 0.5,
            max_multiplier: 2.0,
            weights_path: None,
        }
    }
}

fn builtin_resources() -> HashMap<String, ResourcePolicy> {
    let mut resources = HashMap::new();
    resources.insert(
        "sentiment".to_string(),
        ResourcePolicy {
            default_ttl_secs: 3_600,
            min_ttl_secs: 300,
            max_ttl_secs: 86_400,
            volatility: 0.1,
            key_fields: None,
        },
    );
    resources.insert(
        "conversation".to_string(),
        ResourcePolicy {
            default_ttl_secs: 60,
            min_ttl_secs: 10,
            max_ttl_secs: 600,
            volatility: 0.7,
            key_fields: None,
        },
    );
    resources.insert(
        "resource".to_string(),
        ResourcePolicy {
            default_ttl_secs: 300,
            min_ttl_secs: 30,
            max_ttl_secs: 3_600,
            volatility: 0.4,
            key_fields: None,
        },
    );
    resources
}

impl CacheConfig {
    /// Clamp every knob into its valid range.
    pub fn sanitized(mut self) -> Self {
        self.cacheable_methods = self
            .cacheable_methods
            .iter()
            .map(|method| method.trim().to_ascii_uppercase())
            .filter(|method| !method.is_empty())
            .collect();
        self.bypass_header = self.bypass_header.trim().to_ascii_lowercase();
        self.principal_header = self.principal_header.trim().to_ascii_lowercase();
        self.store_timeout_ms = self.store_timeout_ms.max(1);
        self.recompute_timeout_ms = self.recompute_timeout_ms.max(1);
        self.warm_concurrency = self.warm_concurrency.max(1);
        self.decay_factor = clamp_unit(self.decay_factor, 1.0);
        self.monitor_sample_rate = clamp_unit(self.monitor_sample_rate, DEFAULT_SAMPLE_RATE);
        self.ttl = self.ttl.sanitized();
        self.default_policy = self.default_policy.sanitized();
        self.resources = self
            .resources
            .into_iter()
            .map(|(name, policy)| (name, policy.sanitized()))
            .collect();
        self
    }

    /// Policy for `resource_type`, falling back to the default policy.
    pub fn policy_for(&self, resource_type: &ResourceType) -> &ResourcePolicy {
        self.resources
            .get(resource_type.as_str())
            .unwrap_or(&self.default_policy)
    }

    pub fn is_cacheable_method(&self, method: &str) -> bool {
        self.cacheable_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn recompute_timeout(&self) -> Duration {
        Duration::from_millis(self.recompute_timeout_ms)
    }

    /// Tracker capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn tracker_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.tracker_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

impl ResourcePolicy {
    /// Enforce `1 <= min <= default <= max` and `volatility ∈ [0, 1]`.
    pub fn sanitized(mut self) -> Self {
        self.min_ttl_secs = self.min_ttl_secs.max(1);
        self.max_ttl_secs = self.max_ttl_secs.max(self.min_ttl_secs);
        self.default_ttl_secs = self
            .default_ttl_secs
            .clamp(self.min_ttl_secs, self.max_ttl_secs);
        self.volatility = clamp_unit(self.volatility, 0.5);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl TtlTuning {
    pub fn sanitized(mut self) -> Self {
        self.target_hit_ratio = clamp_unit(self.target_hit_ratio, 0.6);
        self.upper_hit_ratio = clamp_unit(self.upper_hit_ratio, 0.9).max(self.target_hit_ratio);
        self.churn_threshold = if self.churn_threshold.is_finite() {
            self.churn_threshold.max(0.0)
        } else {
            0.1
        };
        self.step = clamp_unit(self.step, 0.05).min(0.25);
        self.frequency_saturation = self.frequency_saturation.max(1);
        self.recency_half_life_secs = self.recency_half_life_secs.max(1);
        self.min_multiplier = if self.min_multiplier.is_finite() {
            self.min_multiplier.max(0.0)
        } else {
            0.5
        };
        self.max_multiplier = if self.max_multiplier.is_finite() {
            self.max_multiplier.max(self.min_multiplier)
        } else {
            self.min_multiplier.max(2.0)
        };
        self
    }
}

fn clamp_unit(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enable_response_cache);
        assert!(config.enable_warming);
        assert!(config.enable_adaptive_ttl);
        assert_eq!(config.cacheable_methods, vec!["GET".to_string()]);
        assert_eq!(config.bypass_header, "x-cache-bypass");
        assert_eq!(config.bypass_query_param, "nocache");
        assert_eq!(config.default_policy.default_ttl_secs, 60);
        assert_eq!(config.warm_max_items, 50);
        assert_eq!(config.warm_min_hits, 3);
    }

    #[test]
    fn unknown_resource_uses_default_policy() {
        let config = CacheConfig::default();
        let policy = config.policy_for(&ResourceType::new("widget"));
        assert_eq!(policy, &config.default_policy);

        let sentiment = config.policy_for(&ResourceType::new("sentiment"));
        assert_eq!(sentiment.default_ttl_secs, 3_600);
    }

    #[test]
    fn inverted_policy_bounds_are_clamped() {
        let policy = ResourcePolicy {
            default_ttl_secs: 5_000,
            min_ttl_secs: 0,
            max_ttl_secs: 0,
            volatility: 4.0,
            key_fields: None,
        }
        .sanitized();

        assert_eq!(policy.min_ttl_secs, 1);
        assert_eq!(policy.max_ttl_secs, 1);
        assert_eq!(policy.default_ttl_secs, 1);
        assert_eq!(policy.volatility, 1.0);
    }

    #[test]
    fn sanitize_normalizes_methods_and_rates() {
        let config = CacheConfig {
            cacheable_methods: vec![" get ".to_string(), "post".to_string(), "".to_string()],
            monitor_sample_rate: f64::NAN,
            decay_factor: -3.0,
            warm_concurrency: 0,
            ..Default::default()
        }
        .sanitized();

        assert_eq!(config.cacheable_methods, vec!["GET", "POST"]);
        assert!(config.is_cacheable_method("post"));
        assert_eq!(config.monitor_sample_rate, 1.0);
        assert_eq!(config.decay_factor, 0.0);
        assert_eq!(config.warm_concurrency, 1);
    }

    #[test]
    fn tuning_thresholds_stay_ordered() {
        let tuning = TtlTuning {
            target_hit_ratio: 0.95,
            upper_hit_ratio: 0.5,
            min_multiplier: 3.0,
            max_multiplier: 1.0,
            ..Default::default()
        }
        .sanitized();

        assert!(tuning.upper_hit_ratio >= tuning.target_hit_ratio);
        assert!(tuning.max_multiplier >= tuning.min_multiplier);
    }

    #[test]
    fn non_zero_capacity_clamps_to_min() {
        let config = CacheConfig {
            tracker_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.tracker_capacity_non_zero().get(), 1);
    }
}
