use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CycleOutcome, ResourceType, TtlWeights, TuneOutcome};
use crate::infra::http::error::ApiError;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::ttl";

pub(super) async fn weights(State(state): State<AdminState>) -> Json<TtlWeights> {
    Json(state.cache.ttl().weights())
}

#[derive(Debug, Deserialize)]
pub(super) struct ComputeQuery {
    resource_type: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct ComputeResponse {
    resource_type: ResourceType,
    key: Option<CacheKey>,
    tracked: bool,
    ttl_secs: u64,
}

/// TTL the cache would assign right now; untracked keys get the policy default.
pub(super) async fn compute(
    State(state): State<AdminState>,
    Query(query): Query<ComputeQuery>,
) -> Result<Json<ComputeResponse>, ApiError> {
    let resource_type = query
        .resource_type
        .filter(|value| !value.trim().is_empty())
        .map(ResourceType::new)
        .ok_or_else(|| ApiError::bad_request("Missing resource_type", None).with_source(SOURCE))?;
    let key = query.key.filter(|value| !value.is_empty()).map(CacheKey::from_raw);

    let record = key
        .as_ref()
        .and_then(|key| state.cache.tracker().snapshot(&resource_type, key));
    let ttl_secs = state.cache.ttl_for(&resource_type, record.as_ref()).as_secs();

    Ok(Json(ComputeResponse {
        tracked: record.is_some(),
        resource_type,
        key,
        ttl_secs,
    }))
}

pub(super) async fn autotune(
    State(state): State<AdminState>,
) -> Result<Json<TuneOutcome>, ApiError> {
    match state.maintenance.tune_once().await {
        CycleOutcome::Completed(outcome) => Ok(Json(outcome)),
        CycleOutcome::Skipped => Err(ApiError::cycle_in_progress("tune").with_source(SOURCE)),
    }
}

pub(super) async fn reset(State(state): State<AdminState>) -> Json<TtlWeights> {
    Json(state.maintenance.reset_weights())
}
