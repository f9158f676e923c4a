//! Request descriptors
//!
//! A [`RequestDescriptor`] is built once by the caller and handed to
//! [`crate::Client::execute`]. Only the retry bookkeeping (attempt count and
//! the auth-retry marker) changes after dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Scheduling hint recorded with each request
///
/// Advisory only: requests are never reordered by priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Per-request flags
///
/// `None` means "use the client default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Send without the credential header and never attempt a refresh
    pub skip_auth: bool,
    /// Coalesce with identical in-flight reads (default: on for reads)
    pub dedupe: Option<bool>,
    /// Retry budget shared by 5xx and 429 retries
    pub retries: Option<u32>,
    /// Base delay for exponential backoff
    pub retry_delay: Option<Duration>,
    pub priority: Priority,
    /// Deadline for each transport attempt
    pub timeout: Option<Duration>,
    /// Key under which the request can be cancelled; a newer request with
    /// the same key cancels this one
    pub cancel_key: Option<String>,
    /// Label for performance stats, such as `"GET /users/:id"`; defaults to
    /// the method and path
    pub endpoint: Option<String>,
}

/// A request as submitted to the client
///
/// ```
/// use std::time::Duration;
///
/// use courier_client::{Priority, RequestDescriptor};
///
/// let request = RequestDescriptor::get("/users")
///     .query("page", "2")
///     .retries(1)
///     .timeout(Duration::from_secs(5))
///     .priority(Priority::High)
///     .cancel_key("user-list")
///     .endpoint("GET /users");
///
/// assert_eq!(request.path(), "/users");
/// assert_eq!(request.options().retries, Some(1));
/// assert_eq!(request.options().endpoint.as_deref(), Some("GET /users"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    /// Relative path (joined onto the base URL) or absolute URL
    pub(crate) path: String,
    pub(crate) query: BTreeMap<String, String>,
    pub(crate) body: Option<Value>,
    pub(crate) headers: HeaderMap,
    pub(crate) options: RequestOptions,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) attempt: u32,
    pub(crate) auth_retried: bool,
}

impl RequestDescriptor {
    /// Request for `path`, relative to the base URL or absolute
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
            headers: HeaderMap::new(),
            options: RequestOptions::default(),
            cancel_token: CancellationToken::new(),
            attempt: 0,
            auth_retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a query parameter. Parameters are kept sorted by name.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Set a JSON body
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Extra header; the client still sets auth, correlation and content
    /// headers itself
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Send without credentials; a 401 is returned as-is
    pub fn skip_auth(mut self) -> Self {
        self.options.skip_auth = true;
        self
    }

    /// Opt a read in or out of coalescing. Writes are never coalesced.
    pub fn dedupe(mut self, enabled: bool) -> Self {
        self.options.dedupe = Some(enabled);
        self
    }

    /// Override the client's retry budget
    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = Some(retries);
        self
    }

    /// Override the backoff base delay
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.options.retry_delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }

    /// Per-attempt deadline, replacing the client default
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Register under `key`, cancelling any request pending under it
    pub fn cancel_key(mut self, key: impl Into<String>) -> Self {
        self.options.cancel_key = Some(key.into());
        self
    }

    /// Group this request's performance stats under `label` instead of its
    /// raw path
    pub fn endpoint(mut self, label: impl Into<String>) -> Self {
        self.options.endpoint = Some(label.into());
        self
    }

    /// Tie the request to a caller-owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Retries spent so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a 401 has already triggered a refresh for this request
    pub fn auth_retried(&self) -> bool {
        self.auth_retried
    }

    /// Safe, idempotent methods
    pub fn is_read(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Reads coalesce unless the caller opted out
    pub fn should_dedupe(&self) -> bool {
        self.is_read() && self.options.dedupe.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_builder_sets_flags() {
        let request = RequestDescriptor::post("/items")
            .json(json!({"name": "a"}))
            .query("b", "2")
            .query("a", "1")
            .retries(1)
            .retry_delay(Duration::from_millis(250))
            .priority(Priority::High)
            .cancel_key("items");

        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.path(), "/items");
        assert_eq!(request.query.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(request.options().retries, Some(1));
        assert_eq!(request.options().cancel_key.as_deref(), Some("items"));
        assert_eq!(request.attempt(), 0);
        assert!(!request.auth_retried());
    }

    #[test]
    fn test_only_reads_dedupe() {
        assert!(RequestDescriptor::get("/a").should_dedupe());
        assert!(!RequestDescriptor::get("/a").dedupe(false).should_dedupe());
        assert!(!RequestDescriptor::post("/a").should_dedupe());
        assert!(!RequestDescriptor::delete("/a").dedupe(true).should_dedupe());
        assert!(RequestDescriptor::new(Method::HEAD, "/a").is_read());
    }

    #[test]
    fn test_priority_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Priority::High).unwrap(), json!("high"));
        assert_eq!(Priority::default().to_string(), "normal");
    }
}
