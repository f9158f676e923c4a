//! Per-endpoint performance counters
//!
//! Purely observational: nothing in the request path reads these numbers.
//! The number of distinct endpoints tracked is capped; endpoints first seen
//! after the cap is reached share the [`OVERFLOW_ENDPOINT`] bucket.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::resilience::CircuitState;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    count: u64,
    errors: u64,
    total: Duration,
    max: Duration,
}

/// Default cap on distinct endpoints
pub const MAX_TRACKED_ENDPOINTS: usize = 256;

/// Bucket for endpoints seen after the cap is reached
pub const OVERFLOW_ENDPOINT: &str = "(other)";

/// Latency and error counters keyed by `"METHOD /path"` or a caller label
#[derive(Debug)]
pub struct PerformanceMonitor {
    endpoints: Mutex<HashMap<String, Accumulator>>,
    max_endpoints: usize,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_ENDPOINTS)
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor tracking at most `max_endpoints` distinct endpoints plus the
    /// overflow bucket
    pub fn with_capacity(max_endpoints: usize) -> Self {
        Self { endpoints: Mutex::new(HashMap::new()), max_endpoints }
    }

    pub fn record(&self, endpoint: &str, latency: Duration, success: bool) {
        let mut endpoints = self.endpoints.lock();
        let tracked = endpoints.len() - usize::from(endpoints.contains_key(OVERFLOW_ENDPOINT));
        let key = if endpoints.contains_key(endpoint) || tracked < self.max_endpoints {
            endpoint
        } else {
            OVERFLOW_ENDPOINT
        };
        let entry = endpoints.entry(key.to_string()).or_default();
        entry.count += 1;
        if !success {
            entry.errors += 1;
        }
        entry.total += latency;
        entry.max = entry.max.max(latency);
    }

    /// Stats for every endpoint seen, sorted by endpoint
    pub fn snapshot(&self) -> Vec<EndpointStats> {
        let endpoints = self.endpoints.lock();
        let mut stats: Vec<_> = endpoints
            .iter()
            .map(|(endpoint, acc)| EndpointStats {
                endpoint: endpoint.clone(),
                count: acc.count,
                errors: acc.errors,
                average_latency_ms: if acc.count == 0 {
                    0.0
                } else {
                    acc.total.as_micros() as f64 / 1_000.0 / acc.count as f64
                },
                max_latency_ms: acc.max.as_millis() as u64,
            })
            .collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    pub fn reset(&self) {
        self.endpoints.lock().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub count: u64,
    pub errors: u64,
    pub average_latency_ms: f64,
    pub max_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterUsage {
    pub in_window: usize,
    pub max_requests: u32,
}

/// Snapshot returned by [`crate::Client::performance_report`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub endpoints: Vec<EndpointStats>,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub rate_limiter: RateLimiterUsage,
    pub pending_requests: usize,
    pub generated_at: DateTime<Utc>,
}
