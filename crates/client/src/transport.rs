//! Transport seam and the reqwest-backed adapter
//!
//! The orchestrator never talks to the network directly. It hands a fully
//! prepared [`TransportRequest`] to a [`Transport`] and gets back either the
//! raw response (any status) or a [`TransportError`] when no response was
//! received at all.

use std::time::Duration;

use async_trait::async_trait;
use courier_common::error::{CommonError, CommonResult};
use reqwest::header::HeaderMap;
use reqwest::{Client as ReqwestClient, Method};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// A request ready to go on the wire
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// Serialized body, if any
    pub body: Option<Vec<u8>>,
    /// Deadline for this single attempt
    pub timeout: Duration,
}

/// Raw response as received, before classification
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    /// Response whose body is the serialized JSON `value`
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Self { status, headers, body: value.to_string().into_bytes() }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// How a transport call failed without producing a usable response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection, DNS, TLS or protocol failure
    Network,
    /// The transport's own deadline expired
    Timeout,
}

/// Transport-level failure
///
/// Transports that surface non-2xx statuses as errors set `status` (and
/// `headers` when they have them); the orchestrator then classifies the
/// failure exactly as it would the equivalent response.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} transport failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub headers: Option<HeaderMap>,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::of_kind(TransportErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::of_kind(TransportErrorKind::Timeout, message)
    }

    fn of_kind(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), status: None, headers: None }
    }

    /// Failure that nonetheless carries a response status
    pub fn with_status(mut self, status: u16, headers: Option<HeaderMap>) -> Self {
        self.status = Some(status);
        self.headers = headers;
        self
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

/// Performs the actual network call
///
/// Implementations must return every received response, whatever its status,
/// as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError>;
}

/// [`Transport`] backed by a shared reqwest connection pool
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ReqwestClient,
}

impl ReqwestTransport {
    /// Start building a new transport.
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Convenience constructor with default configuration.
    pub fn new() -> CommonResult<Self> {
        Self::builder().build()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError> {
        let TransportRequest { method, url, headers, body, timeout } = request;
        debug!(%method, %url, "sending HTTP request");

        let mut builder =
            self.client.request(method.clone(), url.clone()).headers(headers).timeout(timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        debug!(%method, %url, status, bytes = body.len(), "received HTTP response");

        Ok(RawResponse { status, headers, body })
    }
}

/// Builder for [`ReqwestTransport`].
#[derive(Debug)]
pub struct ReqwestTransportBuilder {
    connect_timeout: Duration,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
}

impl Default for ReqwestTransportBuilder {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10), user_agent: None, default_headers: None }
    }
}

impl ReqwestTransportBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn build(self) -> CommonResult<ReqwestTransport> {
        let mut builder = ReqwestClient::builder().connect_timeout(self.connect_timeout).no_proxy();

        if let Some(agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }

        if let Some(headers) = self.default_headers {
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|err| CommonError::config(format!("Failed to build HTTP client: {err}")))?;

        Ok(ReqwestTransport { client })
    }
}
