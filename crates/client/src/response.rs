//! Response envelopes
//!
//! Every call through the client resolves to exactly one
//! [`ResponseEnvelope`]: either `Success` with the decoded payload or
//! `Failure` with a classified error. Errors never escape as `Err` from
//! [`crate::Client::execute`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::option_duration_millis;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ClientError, ErrorKind};

/// Outcome of one client call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEnvelope<T = Value> {
    Success { data: T, status: u16, timestamp: DateTime<Utc> },
    Failure(Failure),
}

/// Classified failure as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    /// Never empty
    pub messages: Vec<String>,
    pub error_code: String,
    pub trace_id: Option<String>,
    /// Wait hint for admission-control rejections and server rate limits
    #[serde(default, with = "option_duration_millis")]
    pub retry_after: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl Failure {
    pub fn from_error(error: &ClientError, timestamp: DateTime<Utc>) -> Self {
        use courier_common::ErrorClassification;

        Self {
            kind: error.kind(),
            status_code: error.status(),
            messages: error.messages(),
            error_code: error.error_code(),
            trace_id: error.trace_id().map(str::to_string),
            retry_after: error.retry_after(),
            timestamp,
        }
    }
}

impl<T> ResponseEnvelope<T> {
    pub fn success(data: T, status: u16, timestamp: DateTime<Utc>) -> Self {
        Self::Success { data, status, timestamp }
    }

    pub fn failure(error: &ClientError, timestamp: DateTime<Utc>) -> Self {
        Self::Failure(Failure::from_error(error, timestamp))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Failure(_) => None,
        }
    }

    pub fn failure_ref(&self) -> Option<&Failure> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Success { timestamp, .. } => *timestamp,
            Self::Failure(failure) => failure.timestamp,
        }
    }

    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl ResponseEnvelope<Value> {
    /// Decode the payload into `U`.
    ///
    /// A payload that does not match `U` becomes a `DECODE_ERROR` failure.
    pub fn decode<U: DeserializeOwned>(self) -> ResponseEnvelope<U> {
        match self {
            Self::Success { data, status, timestamp } => match serde_json::from_value(data) {
                Ok(data) => ResponseEnvelope::Success { data, status, timestamp },
                Err(err) => ResponseEnvelope::failure(
                    &ClientError::Decode { status, message: err.to_string() },
                    timestamp,
                ),
            },
            Self::Failure(failure) => ResponseEnvelope::Failure(failure),
        }
    }
}

/// Payload for a successful response: JSON when it parses, the raw text
/// otherwise, `null` when empty.
pub(crate) fn parse_payload(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
