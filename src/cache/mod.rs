//! Request-level response cache.
//!
//! - **Keys**: deterministic SHA-256 fingerprints namespaced by resource type
//! - **Store**: async contract over a TTL key-value store, fail-open on errors
//! - **Middleware**: serves hits, captures 2xx misses, invalidates by pattern
//! - **Tracker**: bounded access index and proactive warming
//! - **TTL**: adaptive lifetimes from frequency, recency and volatility
//! - **Monitor**: hit-ratio and churn reports that drive TTL tuning
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enable_response_cache = true
//! enable_adaptive_ttl = true
//! warm_min_hits = 3
//!
//! [cache.resources.sentiment]
//! default_ttl_secs = 3600
//! min_ttl_secs = 300
//! max_ttl_secs = 86400
//! volatility = 0.1
//! ```

mod config;
mod keys;
mod lock;
mod middleware;
mod monitor;
mod scheduler;
mod store;
mod tracker;
mod ttl;

use serde::Serializer;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub use config::{CacheConfig, ResourcePolicy, TtlTuning};
pub use keys::{CacheKey, RequestDescriptor, ResourceType, generate_key, generate_key_with_fields};
pub use middleware::{
    BypassReason, CacheOutcome, CacheableResponse, HandlerResponse, Intercepted, ResponseCache,
};
pub use monitor::{
    EfficiencyMonitor, EfficiencyReport, MonitoringStatus, ReportStatus, ResourceEfficiency,
};
pub use scheduler::{CacheMaintenance, CycleIntervals, CycleOutcome, SchedulerHandle};
pub use store::{BoundedStore, CacheEntry, CacheStore, MemoryStore, StoreError, glob_match};
pub use tracker::{
    AccessRecord, AccessTracker, Recompute, RecomputeError, RecomputeFn, WarmReport, recompute_fn,
};
pub use ttl::{AdaptiveTtl, TtlWeights, TuneOutcome, WeightsDelta, WeightsFileError};

pub(crate) fn serialize_rfc3339<S: Serializer>(
    value: &OffsetDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let formatted = value
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}
