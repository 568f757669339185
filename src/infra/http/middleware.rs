use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderName, HeaderValue, Request, StatusCode,
        header::{CONTENT_TYPE, SET_COOKIE},
        request::Parts as RequestParts,
        response::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::cache::{
    CacheEntry, CacheableResponse, Recompute, RequestDescriptor, ResourceType,
    ResponseCache,
};

use super::error::ErrorReport;

pub const CACHE_STATUS_HEADER: &str = "x-cache";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "respcache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "respcache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "client request error",
            );
        }
    }

    response
}

/// Builds the warming capability for a request, if the route supports one.
pub type RecomputeFactory =
    Arc<dyn Fn(&RequestDescriptor) -> Option<Arc<dyn Recompute>> + Send + Sync>;

/// Per-route state for `response_cache_layer`.
#[derive(Clone)]
pub struct CacheLayerState {
    pub cache: Arc<ResponseCache>,
    pub resource_type: ResourceType,
    pub recompute: Option<RecomputeFactory>,
}

impl CacheLayerState {
    pub fn new(cache: Arc<ResponseCache>, resource_type: impl Into<ResourceType>) -> Self {
        Self {
            cache,
            resource_type: resource_type.into(),
            recompute: None,
        }
    }

    pub fn with_recompute(
        mut self,
        factory: impl Fn(&RequestDescriptor) -> Option<Arc<dyn Recompute>> + Send + Sync + 'static,
    ) -> Self {
        self.recompute = Some(Arc::new(factory));
        self
    }
}

/// Response cache middleware for axum routes.
///
/// Maps the request onto a `RequestDescriptor`, delegates to
/// `ResponseCache::intercept_with_recompute` and tags the response with an
/// `x-cache` header. The bypass rules only look at the request head, so
/// skipped requests reach the handler with their body unread. Cacheable
/// requests whose body may exceed the configured limit pass through as well.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = state.cache.config();
    let body_limit = config.body_limit_bytes;

    let (parts, body) = request.into_parts();
    let head = describe_head(&parts, &config.principal_header);

    if state.cache.bypass_reason(&head).is_some() {
        let request = Request::from_parts(parts, body);
        return run_through_cache(&state, &head, None, request, next, None).await;
    }

    let within_limit = body
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= body_limit as u64);
    if !within_limit {
        debug!(cache = "response", outcome = "bypass", reason = "body_limit");
        let mut response = next.run(Request::from_parts(parts, body)).await;
        tag_outcome(&mut response, "bypass");
        return response;
    }

    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return request_body_rejection(&err),
    };

    let descriptor = describe_body(head, &bytes);
    let recompute = state
        .recompute
        .as_ref()
        .and_then(|factory| factory(&descriptor));
    let request = Request::from_parts(parts, Body::from(bytes));

    run_through_cache(&state, &descriptor, recompute, request, next, Some(body_limit)).await
}

/// Runs the request through the cache. Responses are only buffered when a
/// `capture_limit` is given.
async fn run_through_cache(
    state: &CacheLayerState,
    descriptor: &RequestDescriptor,
    recompute: Option<Arc<dyn Recompute>>,
    request: Request<Body>,
    next: Next,
    capture_limit: Option<usize>,
) -> Response {
    let intercepted = state
        .cache
        .intercept_with_recompute(&state.resource_type, descriptor, recompute, || async move {
            let response = next.run(request).await;
            let captured = match capture_limit {
                Some(limit) => CapturedResponse::capture(response, limit).await,
                None => CapturedResponse::Passthrough(response),
            };
            Ok::<_, Infallible>(captured)
        })
        .await;

    let (captured, outcome) = match intercepted {
        Ok(intercepted) => (intercepted.response, intercepted.outcome),
        Err(never) => match never {},
    };

    let mut response = captured.into_response();
    tag_outcome(&mut response, outcome.as_str());
    response
}

fn tag_outcome(response: &mut Response, label: &'static str) {
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(label));
}

/// Same status and text as axum's `Bytes` extractor when the body read fails.
fn request_body_rejection(err: &axum::Error) -> Response {
    warn!(error = %err, "failed to buffer request body");
    let mut response = (
        StatusCode::BAD_REQUEST,
        format!("Failed to buffer the request body: {err}"),
    )
        .into_response();
    ErrorReport::from_error("infra::http::response_cache_layer", err).attach(&mut response);
    response
}

/// Describe everything the bypass rules look at: method, path, query,
/// headers and principal.
fn describe_head(parts: &RequestParts, principal_header: &str) -> RequestDescriptor {
    let mut descriptor = RequestDescriptor::new(parts.method.as_str(), parts.uri.path());

    if let Some(raw) = parts.uri.query() {
        descriptor = url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .fold(descriptor, |descriptor, (name, value)| {
                descriptor.with_query(name, value)
            });
    }

    descriptor.headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    descriptor.principal = descriptor.headers.get(principal_header).cloned();
    descriptor
}

/// JSON bodies are keyed by value; anything else by its exact bytes.
fn describe_body(descriptor: RequestDescriptor, bytes: &Bytes) -> RequestDescriptor {
    if bytes.is_empty() {
        return descriptor;
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => descriptor.with_body(value),
        Err(_) => descriptor.with_raw_body(bytes.clone()),
    }
}

/// An axum response as seen by the cache.
pub enum CapturedResponse {
    /// Fully buffered; cacheable when `storable`.
    Buffered {
        parts: Parts,
        body: Bytes,
        storable: bool,
    },
    /// Left streaming; never cached.
    Passthrough(Response),
}

impl CapturedResponse {
    async fn capture(response: Response, limit: usize) -> Self {
        if !should_store_response(&response, limit) {
            return Self::Passthrough(response);
        }

        let (parts, body) = response.into_parts();
        match BodyExt::collect(body).await {
            Ok(collected) => {
                let body = collected.to_bytes();
                let storable = body.len() <= limit;
                Self::Buffered {
                    parts,
                    body,
                    storable,
                }
            }
            Err(err) => {
                let mut response = Response::from_parts(parts, Body::empty());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                warn!(error = %err, "failed to buffer response body");
                ErrorReport::from_error("infra::http::response_cache_layer", &err)
                    .attach(&mut response);
                Self::Passthrough(response)
            }
        }
    }
}

/// Only successful, non-streaming, cookie-free responses of known small size are buffered.
fn should_store_response(response: &Response, limit: usize) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= limit as u64)
}

impl CacheableResponse for CapturedResponse {
    fn status(&self) -> u16 {
        match self {
            Self::Buffered { parts, .. } => parts.status.as_u16(),
            Self::Passthrough(response) => response.status().as_u16(),
        }
    }

    fn to_entry(&self, ttl: Duration) -> Option<CacheEntry> {
        match self {
            Self::Buffered {
                parts,
                body,
                storable: true,
            } => {
                let content_type = parts
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                Some(CacheEntry::new(
                    parts.status.as_u16(),
                    content_type,
                    body.clone(),
                    ttl,
                ))
            }
            _ => None,
        }
    }

    fn from_entry(entry: CacheEntry) -> Self {
        let mut response = Response::new(Body::empty());
        *response.status_mut() =
            StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
        if let Some(value) = entry
            .content_type
            .as_deref()
            .and_then(|value| HeaderValue::from_str(value).ok())
        {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        let age = entry.age_at(time::OffsetDateTime::now_utc()).as_secs();
        response
            .headers_mut()
            .insert(HeaderName::from_static("age"), HeaderValue::from(age));

        let (parts, _) = response.into_parts();
        Self::Buffered {
            parts,
            body: entry.body,
            storable: false,
        }
    }
}

impl IntoResponse for CapturedResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Buffered { parts, body, .. } => Response::from_parts(parts, Body::from(body)),
            Self::Passthrough(response) => response,
        }
    }
}
