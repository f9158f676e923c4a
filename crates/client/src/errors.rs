//! Client error taxonomy
//!
//! Every failure is classified exactly once, at the transport boundary, into
//! a [`ClientError`]. Downstream code (retry policy, circuit breaker, token
//! refresh, envelope construction) matches on the variant and never inspects
//! raw responses again.

use std::time::{Duration, SystemTime};

use courier_common::error::{ErrorClassification, ErrorSeverity};
use courier_common::resilience::MonitoredFailure;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::retry::parse_retry_after;
use crate::transport::{RawResponse, TransportError, TransportErrorKind};

/// Failure category reported in a [`crate::Failure`] envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No response was received
    Network,
    /// The transport deadline expired
    Timeout,
    /// The caller (or client shutdown) cancelled the request
    Aborted,
    /// The circuit breaker rejected the request locally
    CircuitOpen,
    /// The local rate limiter rejected the request
    RateLimitedLocal,
    /// The server answered 429 and the retry budget is spent
    RateLimitedRemote,
    /// Any other non-2xx response
    Api,
    /// Credentials could not be renewed
    SessionExpired,
}

/// Errors produced while executing a request
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Request aborted")]
    Aborted,

    #[error("Circuit breaker open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Rate limit exceeded locally, retry in {retry_after:?}")]
    RateLimitedLocal { retry_after: Duration },

    #[error("Rate limited by server")]
    RateLimitedRemote {
        retry_after: Option<Duration>,
        messages: Vec<String>,
        trace_id: Option<String>,
    },

    #[error("API error {status}: {}", messages.join("; "))]
    Api { status: u16, messages: Vec<String>, code: Option<String>, trace_id: Option<String> },

    #[error("Response body could not be decoded: {message}")]
    Decode { status: u16, message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Session expired: {message}")]
    SessionExpired { message: String },

    #[error("Token refresh failed: {message}")]
    TokenRefreshFailed { message: String },
}

impl ClientError {
    /// Classify a non-2xx response.
    ///
    /// `now` anchors HTTP-date `Retry-After` values.
    pub fn from_response(response: &RawResponse, now: SystemTime) -> Self {
        let parsed = ErrorBody::parse(&response.body);
        let trace_id = parsed
            .trace_id
            .or_else(|| response.header("x-trace-id").map(str::to_string))
            .or_else(|| response.header("x-request-id").map(str::to_string));
        let messages = if parsed.messages.is_empty() {
            vec![canonical_message(response.status)]
        } else {
            parsed.messages
        };

        if response.status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
            let retry_after = response
                .header(reqwest::header::RETRY_AFTER.as_str())
                .and_then(|value| parse_retry_after(value, now));
            return Self::RateLimitedRemote { retry_after, messages, trace_id };
        }

        Self::Api { status: response.status, messages, code: parsed.code, trace_id }
    }

    /// Classify a transport failure.
    ///
    /// `timeout` is the deadline that was in force for the attempt.
    pub fn from_transport(error: TransportError, timeout: Duration, now: SystemTime) -> Self {
        if let Some(status) = error.status {
            let response =
                RawResponse { status, headers: error.headers.unwrap_or_default(), body: Vec::new() };
            return Self::from_response(&response, now);
        }
        match error.kind {
            TransportErrorKind::Timeout => Self::Timeout { timeout },
            TransportErrorKind::Network => Self::Network { message: error.message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Aborted => ErrorKind::Aborted,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimitedLocal { .. } => ErrorKind::RateLimitedLocal,
            Self::RateLimitedRemote { .. } => ErrorKind::RateLimitedRemote,
            Self::Api { .. } | Self::Decode { .. } | Self::InvalidRequest { .. } => ErrorKind::Api,
            Self::SessionExpired { .. } | Self::TokenRefreshFailed { .. } => {
                ErrorKind::SessionExpired
            }
        }
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> String {
        match self {
            Self::Network { .. } => "NETWORK_ERROR".to_string(),
            Self::Timeout { .. } => "TIMEOUT".to_string(),
            Self::Aborted => "ABORTED".to_string(),
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN".to_string(),
            Self::RateLimitedLocal { .. } => "RATE_LIMITED_LOCAL".to_string(),
            Self::RateLimitedRemote { .. } => "RATE_LIMITED".to_string(),
            Self::Api { code: Some(code), .. } => code.clone(),
            Self::Api { status, .. } => format!("HTTP_{status}"),
            Self::Decode { .. } => "DECODE_ERROR".to_string(),
            Self::InvalidRequest { .. } => "INVALID_REQUEST".to_string(),
            Self::SessionExpired { .. } => "SESSION_EXPIRED".to_string(),
            Self::TokenRefreshFailed { .. } => "TOKEN_REFRESH_FAILED".to_string(),
        }
    }

    /// HTTP status associated with the failure, if a response was involved
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Decode { status, .. } => Some(*status),
            Self::RateLimitedRemote { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            Self::SessionExpired { .. } | Self::TokenRefreshFailed { .. } => {
                Some(StatusCode::UNAUTHORIZED.as_u16())
            }
            _ => None,
        }
    }

    /// Human-readable messages; never empty
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Api { messages, .. } | Self::RateLimitedRemote { messages, .. }
                if !messages.is_empty() =>
            {
                messages.clone()
            }
            other => vec![other.to_string()],
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        match self {
            Self::Api { trace_id, .. } | Self::RateLimitedRemote { trace_id, .. } => {
                trace_id.as_deref()
            }
            _ => None,
        }
    }

    /// Whether this is a 401 from the server
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == StatusCode::UNAUTHORIZED.as_u16())
    }
}

impl ErrorClassification for ClientError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => (500..600).contains(status),
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::CircuitOpen { .. }
            | Self::RateLimitedLocal { .. }
            | Self::RateLimitedRemote { .. } => true,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Aborted => ErrorSeverity::Info,
            Self::CircuitOpen { .. }
            | Self::RateLimitedLocal { .. }
            | Self::RateLimitedRemote { .. }
            | Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Api { status, .. } if *status < 500 => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after } | Self::RateLimitedLocal { retry_after } => {
                Some(*retry_after)
            }
            Self::RateLimitedRemote { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl MonitoredFailure for ClientError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimitedRemote { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            _ => None,
        }
    }
}

fn canonical_message(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

/// Best-effort extraction of messages, code and trace id from an error body
#[derive(Debug, Default)]
struct ErrorBody {
    messages: Vec<String>,
    code: Option<String>,
    trace_id: Option<String>,
}

impl ErrorBody {
    fn parse(body: &[u8]) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        let mut parsed = Self::default();

        // `{"error": {"message": ..., "code": ...}}` nests the same fields.
        let nested = match map.get("error") {
            Some(Value::Object(inner)) => Some(inner),
            _ => None,
        };

        for source in std::iter::once(&map).chain(nested) {
            collect_messages(source.get("message"), &mut parsed.messages);
            collect_messages(source.get("messages"), &mut parsed.messages);
            if parsed.code.is_none() {
                parsed.code = ["errorCode", "code"]
                    .iter()
                    .find_map(|key| source.get(*key).and_then(scalar_string));
            }
            if parsed.trace_id.is_none() {
                parsed.trace_id = ["traceId", "trace_id"]
                    .iter()
                    .find_map(|key| source.get(*key).and_then(scalar_string));
            }
        }

        if parsed.code.is_none() {
            parsed.code = map.get("error").and_then(|value| value.as_str()).map(str::to_string);
        }
        parsed
    }
}

fn collect_messages(value: Option<&Value>, out: &mut Vec<String>) {
    match value {
        Some(Value::String(message)) if !message.is_empty() => out.push(message.clone()),
        Some(Value::Array(items)) => {
            out.extend(items.iter().filter_map(|item| item.as_str()).map(str::to_string))
        }
        _ => {}
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
