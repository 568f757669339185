mod admin;
pub mod error;
pub mod middleware;

pub use admin::{AdminState, build_admin_router};
pub use error::{ApiError, ErrorReport};
pub use middleware::{
    CACHE_STATUS_HEADER, CacheLayerState, CapturedResponse, RecomputeFactory, log_responses,
    response_cache_layer, set_request_context,
};
