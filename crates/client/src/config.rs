//! Client configuration
//!
//! Configuration comes from defaults, optionally a TOML or JSON file, and
//! then environment overrides. Durations are written as milliseconds.
//!
//! ## Environment Variables
//! - `COURIER_BASE_URL`: Base URL requests are resolved against
//! - `COURIER_TIMEOUT_MS`: Per-attempt transport deadline
//! - `COURIER_MAX_RETRIES`: Default retry budget
//! - `COURIER_RETRY_BASE_DELAY_MS`: Backoff base delay
//! - `COURIER_MAX_RETRY_AFTER_MS`: Longest `Retry-After` worth waiting for
//! - `COURIER_RATE_LIMIT_MAX_REQUESTS`: Admissions per window
//! - `COURIER_RATE_LIMIT_WINDOW_MS`: Sliding window length
//! - `COURIER_CIRCUIT_FAILURE_THRESHOLD`: Failures before the breaker opens
//! - `COURIER_CIRCUIT_RESET_TIMEOUT_MS`: Breaker cooldown

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use courier_common::duration_millis;
use courier_common::error::{CommonError, CommonResult};
use courier_common::resilience::{CircuitBreakerConfig, RateLimiterConfig, MAX_BACKOFF_DELAY};
use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use url::Url;

/// Settings for one [`crate::Client`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relative request paths are joined onto this URL
    pub base_url: String,
    /// Default deadline for each transport attempt
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    /// Wait before retrying a 429 that carried no `Retry-After`
    #[serde(with = "duration_millis")]
    pub rate_limited_fallback_delay: Duration,
    /// Longest server-advised `Retry-After` the client will wait out; a 429
    /// asking for more is returned to the caller without retrying
    #[serde(with = "duration_millis")]
    pub max_retry_after: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    /// Upper bound on concurrent transport calls; unbounded when unset
    pub max_concurrent_requests: Option<usize>,
    /// Header carrying the per-attempt correlation id
    pub correlation_header: String,
    pub refresh_path: String,
    /// Paths that never trigger a token refresh on 401
    pub auth_path_prefixes: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            rate_limited_fallback_delay: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(300),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            max_concurrent_requests: None,
            correlation_header: "X-Request-ID".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            auth_path_prefixes: vec!["/auth/".to_string()],
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(contents: &str) -> CommonResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_json_str(contents: &str) -> CommonResult<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Load from a file; the format follows the extension (`.toml` or
    /// `.json`).
    pub fn from_file(path: &Path) -> CommonResult<Self> {
        if !path.exists() {
            return Err(CommonError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading client configuration from file");
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CommonError::persistence_op("read", format!("{}: {e}", path.display()))
        })?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("toml") {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            other => Err(CommonError::config(format!("Unsupported config format: {other}"))),
        }
    }

    /// Defaults (or `path`), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> CommonResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the `COURIER_*` environment variables that are set
    pub fn apply_env_overrides(&mut self) -> CommonResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production)
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> CommonResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("COURIER_BASE_URL") {
            self.base_url = url;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COURIER_TIMEOUT_MS")? {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var(&lookup, "COURIER_MAX_RETRIES")? {
            self.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COURIER_RETRY_BASE_DELAY_MS")? {
            self.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COURIER_MAX_RETRY_AFTER_MS")? {
            self.max_retry_after = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, "COURIER_RATE_LIMIT_MAX_REQUESTS")? {
            self.rate_limiter.max_requests = max;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COURIER_RATE_LIMIT_WINDOW_MS")? {
            self.rate_limiter.window = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var(&lookup, "COURIER_CIRCUIT_FAILURE_THRESHOLD")? {
            self.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COURIER_CIRCUIT_RESET_TIMEOUT_MS")? {
            self.circuit_breaker.reset_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> CommonResult<()> {
        Url::parse(&self.base_url).map_err(|e| {
            CommonError::validation_with_value("base_url", e.to_string(), self.base_url.clone())
        })?;
        if self.timeout.is_zero() {
            return Err(CommonError::validation("timeout", "must be greater than zero"));
        }
        if self.retry_base_delay.is_zero() || self.retry_base_delay > MAX_BACKOFF_DELAY {
            return Err(CommonError::validation(
                "retry_base_delay",
                format!("must be within (0, {MAX_BACKOFF_DELAY:?}]"),
            ));
        }
        self.circuit_breaker.validate()?;
        self.rate_limiter.validate()?;
        if self.max_concurrent_requests == Some(0) {
            return Err(CommonError::validation(
                "max_concurrent_requests",
                "must be greater than zero when set",
            ));
        }
        HeaderName::from_str(&self.correlation_header).map_err(|e| {
            CommonError::validation_with_value(
                "correlation_header",
                e.to_string(),
                self.correlation_header.clone(),
            )
        })?;
        if self.refresh_path.is_empty() {
            return Err(CommonError::validation("refresh_path", "must not be empty"));
        }
        Ok(())
    }

    /// Resolve a request path (or absolute URL) against the base URL
    pub fn resolve_url(&self, path: &str) -> Result<Url, url::ParseError> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        let base = Url::parse(&self.base_url)?;
        let trimmed = base.as_str().trim_end_matches('/');
        Url::parse(&format!("{trimmed}/{}", path.trim_start_matches('/')))
    }

    /// Whether `url` addresses an authentication endpoint
    pub fn is_auth_path(&self, url: &Url) -> bool {
        let path = url.path();
        let refresh = self.refresh_path.trim_end_matches('/');
        path.ends_with(refresh)
            || self.auth_path_prefixes.iter().any(|prefix| path.contains(prefix.as_str()))
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> CommonResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                CommonError::config_field(key, format!("invalid value '{raw}': {e}"))
            })
        })
        .transpose()
}
