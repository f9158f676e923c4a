//! HTTP retry policy
//!
//! Decides, for a classified [`ClientError`], whether another attempt is
//! worth making and how long to wait first:
//!
//! - server errors (5xx) back off exponentially from the base delay
//! - server rate limiting (429) waits for `Retry-After`, else a fixed
//!   fallback; a `Retry-After` beyond the configured ceiling stops instead
//! - everything else (network failures, cancellation, local rejections,
//!   other 4xx) stops immediately
//!
//! Both retryable categories draw from one budget per request.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use courier_common::resilience::{ExponentialBackoff, RetryDecision, RetryPolicy};
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::request::RequestOptions;

/// Retry policy for one request
#[derive(Debug, Clone)]
pub struct HttpRetryPolicy {
    max_retries: u32,
    backoff: ExponentialBackoff,
    rate_limited_fallback: Duration,
    max_retry_after: Duration,
}

impl HttpRetryPolicy {
    /// Policy allowing `max_retries` retries, backing off with `backoff` on
    /// server errors and waiting `rate_limited_fallback` on a 429 without
    /// `Retry-After`. Any advised wait is honoured until
    /// [`Self::with_max_retry_after`] sets a ceiling.
    pub fn new(
        max_retries: u32,
        backoff: ExponentialBackoff,
        rate_limited_fallback: Duration,
    ) -> Self {
        Self { max_retries, backoff, rate_limited_fallback, max_retry_after: Duration::MAX }
    }

    /// Give up on a 429 whose `Retry-After` exceeds `ceiling`
    pub fn with_max_retry_after(mut self, ceiling: Duration) -> Self {
        self.max_retry_after = ceiling;
        self
    }

    /// Policy for a request, applying its overrides to the client defaults.
    ///
    /// A per-request base delay outside the accepted range falls back to the
    /// configured one.
    pub fn for_request(config: &ClientConfig, options: &RequestOptions) -> Self {
        let base = options.retry_delay.unwrap_or(config.retry_base_delay);
        let backoff = ExponentialBackoff::new(base)
            .or_else(|_| ExponentialBackoff::new(config.retry_base_delay))
            .unwrap_or_else(|_| ExponentialBackoff::default());
        Self::new(
            options.retries.unwrap_or(config.max_retries),
            backoff,
            config.rate_limited_fallback_delay,
        )
        .with_max_retry_after(config.max_retry_after)
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl RetryPolicy<ClientError> for HttpRetryPolicy {
    fn should_retry(&self, error: &ClientError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::Stop;
        }

        match error {
            ClientError::Api { status, .. } if (500..600).contains(status) => {
                RetryDecision::RetryAfter(self.backoff.delay(attempt))
            }
            ClientError::RateLimitedRemote { retry_after: Some(advised), .. }
                if *advised > self.max_retry_after =>
            {
                debug!(
                    advised_ms = advised.as_millis() as u64,
                    ceiling_ms = self.max_retry_after.as_millis() as u64,
                    "Server asked for a longer wait than allowed, giving up"
                );
                RetryDecision::Stop
            }
            ClientError::RateLimitedRemote { retry_after, .. } => {
                let delay = retry_after.unwrap_or(self.rate_limited_fallback);
                debug!(delay_ms = delay.as_millis() as u64, "Server rate limit, backing off");
                RetryDecision::RetryAfter(delay)
            }
            _ => RetryDecision::Stop,
        }
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let now = DateTime::<Utc>::from(now);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
