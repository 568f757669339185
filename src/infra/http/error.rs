use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Diagnostic chain attached to error responses for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    pub fn from_message(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
    pub const CYCLE_IN_PROGRESS: &str = "cycle_in_progress";
    pub const FEATURE_DISABLED: &str = "feature_disabled";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    source: &'static str,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            source: "infra::http::admin",
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn store_unavailable(error: &dyn StdError) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::STORE_UNAVAILABLE,
            "Cache store unavailable",
            Some(error.to_string()),
        )
    }

    pub fn cycle_in_progress(cycle: &'static str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            codes::CYCLE_IN_PROGRESS,
            "Cycle already running",
            Some(format!("a {cycle} cycle is in flight; retry later")),
        )
    }

    pub fn feature_disabled(feature: &'static str) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            codes::FEATURE_DISABLED,
            "Feature disabled",
            Some(format!("{feature} is disabled in configuration")),
        )
    }

    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            self.source,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("store write failed")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn from_error_walks_the_source_chain() {
        let err = Outer(std::io::Error::other("connection reset"));
        let report = ErrorReport::from_error("cache::store", &err);
        assert_eq!(report.source, "cache::store");
        assert_eq!(report.messages, vec!["store write failed", "connection reset"]);
    }

    #[test]
    fn api_error_response_carries_its_report() {
        let response = ApiError::feature_disabled("warming")
            .with_source("infra::http::admin::cache")
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.source, "infra::http::admin::cache");
        assert_eq!(
            report.messages,
            vec!["feature_disabled: warming is disabled in configuration"]
        );
    }
}
