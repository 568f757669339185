use axum::{http::StatusCode, response::IntoResponse};

pub(super) async fn admin_health() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
