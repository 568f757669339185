//! Cache key definitions.
//!
//! Defines `ResourceType` namespaces, the `RequestDescriptor` callers hand to the
//! cache, and the fingerprinting that turns a descriptor into a `CacheKey`.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Namespace for a family of cached computations (`sentiment`, `conversation`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Store key of the form `{resource_type}:{sha256-hex}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-formatted key, e.g. one returned by a store scan.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace prefix before the first `:`.
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.0
            .split_once(':')
            .map(|(prefix, _)| ResourceType::new(prefix))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-neutral description of an incoming request.
///
/// Everything the fingerprint may depend on lives here; the HTTP adapter and
/// direct callers both build one of these.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    /// Repeated parameters keep every value in arrival order.
    pub query: BTreeMap<String, Vec<String>>,
    pub body: Option<Value>,
    /// Body that is not JSON, fingerprinted byte for byte.
    pub raw_body: Option<Bytes>,
    pub principal: Option<String>,
    /// Header names are stored lower-cased.
    pub headers: BTreeMap<String, String>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }
}

/// Fingerprint a request using every query and body field.
pub fn generate_key(request: &RequestDescriptor, resource_type: &ResourceType) -> CacheKey {
    generate_key_with_fields(request, resource_type, None)
}

/// Fingerprint a request, keeping only `fields` from the query and a JSON object body.
///
/// `None` keeps everything. Missing fields hash as empty values.
pub fn generate_key_with_fields(
    request: &RequestDescriptor,
    resource_type: &ResourceType,
    fields: Option<&[String]>,
) -> CacheKey {
    let canonical = canonical_form(request, fields);
    // serde_json::Map is ordered by key, so nested objects serialize sorted too.
    let encoded = canonical.to_string();

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    let digest = hex::encode(hasher.finalize());

    CacheKey(format!("{resource_type}:{digest}"))
}

fn canonical_form(request: &RequestDescriptor, fields: Option<&[String]>) -> Value {
    let query: Map<String, Value> = request
        .query
        .iter()
        .filter(|(name, _)| keep_field(fields, name))
        .map(|(name, values)| {
            let values = values.iter().cloned().map(Value::String).collect();
            (name.clone(), Value::Array(values))
        })
        .collect();

    let body = match (&request.body, fields) {
        (None, _) | (Some(Value::Null), _) => Value::String(String::new()),
        (Some(Value::Object(map)), Some(_)) => Value::Object(
            map.iter()
                .filter(|(name, _)| keep_field(fields, name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
        (Some(other), _) => other.clone(),
    };

    json!({
        "method": request.method.trim().to_ascii_uppercase(),
        "path": normalize_path(&request.path),
        "query": query,
        "body": body,
        "raw_body": request.raw_body.as_deref().map(hex::encode).unwrap_or_default(),
        "principal": request.principal.clone().unwrap_or_default(),
    })
}

fn keep_field(fields: Option<&[String]>, name: &str) -> bool {
    fields.is_none_or(|allowed| allowed.iter().any(|field| field == name))
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim();
    match trimmed.trim_end_matches('/') {
        "" if trimmed.starts_with('/') => "/",
        other => other,
    }
}
