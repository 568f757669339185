//! Operator surface over one `ResponseCache`: inspection, warming, tuning and invalidation.

mod cache;
mod efficiency;
mod health;
mod state;
mod ttl;

pub use state::AdminState;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use super::middleware::{log_responses, set_request_context};

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health::admin_health))
        .route("/cache/top", get(cache::top_resources))
        .route("/cache/warm", post(cache::warm))
        .route("/cache/tracker/reset", post(cache::reset_tracker))
        .route("/cache/invalidate", post(cache::invalidate))
        .route("/ttl/weights", get(ttl::weights))
        .route("/ttl/compute", get(ttl::compute))
        .route("/ttl/autotune", post(ttl::autotune))
        .route("/ttl/reset", post(ttl::reset))
        .route("/efficiency/report", get(efficiency::report))
        .route("/efficiency/status", get(efficiency::status))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
