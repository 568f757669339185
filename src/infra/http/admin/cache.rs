use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{AccessRecord, CycleOutcome, WarmReport};
use crate::infra::http::error::ApiError;

use super::AdminState;

const SOURCE: &str = "infra::http::admin::cache";

#[derive(Debug, Deserialize)]
pub(super) struct TopQuery {
    max_items: Option<usize>,
    min_hits: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(super) struct TopResponse {
    items: Vec<AccessRecord>,
    tracked: usize,
}

pub(super) async fn top_resources(
    State(state): State<AdminState>,
    Query(query): Query<TopQuery>,
) -> Json<TopResponse> {
    let config = state.cache.config();
    let max_items = query.max_items.unwrap_or(config.warm_max_items);
    let min_hits = query.min_hits.unwrap_or(config.warm_min_hits);
    let tracker = state.cache.tracker();

    Json(TopResponse {
        items: tracker.top_resources(max_items, min_hits),
        tracked: tracker.len(),
    })
}

pub(super) async fn warm(State(state): State<AdminState>) -> Result<Json<WarmReport>, ApiError> {
    match state.maintenance.warm_once().await {
        CycleOutcome::Completed(Some(report)) => Ok(Json(report)),
        CycleOutcome::Completed(None) => {
            Err(ApiError::feature_disabled("cache warming").with_source(SOURCE))
        }
        CycleOutcome::Skipped => Err(ApiError::cycle_in_progress("warm").with_source(SOURCE)),
    }
}

#[derive(Debug, Serialize)]
pub(super) struct ResetResponse {
    cleared: usize,
}

pub(super) async fn reset_tracker(State(state): State<AdminState>) -> Json<ResetResponse> {
    let tracker = state.cache.tracker();
    let cleared = tracker.len();
    tracker.reset();
    info!(cleared, "access tracker reset");
    Json(ResetResponse { cleared })
}

#[derive(Debug, Deserialize)]
pub(super) struct InvalidateQuery {
    pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct InvalidateResponse {
    pattern: String,
    deleted: usize,
}

pub(super) async fn invalidate(
    State(state): State<AdminState>,
    Query(query): Query<InvalidateQuery>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let pattern = query
        .pattern
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request(
                "Missing pattern",
                Some("pass ?pattern=<resource_type>:*".to_string()),
            )
            .with_source(SOURCE)
        })?;

    let deleted = state
        .cache
        .invalidate(&pattern)
        .await
        .map_err(|err| ApiError::store_unavailable(&err).with_source(SOURCE))?;

    Ok(Json(InvalidateResponse { pattern, deleted }))
}
