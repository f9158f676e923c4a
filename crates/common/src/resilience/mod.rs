//! Resilience patterns for fault tolerance
//!
//! This module provides the generic gates a client puts in front of an
//! unreliable dependency:
//! - **Circuit Breaker**: stops calling a dependency after repeated monitored
//!   failures and probes it for recovery after a cooldown
//! - **Sliding-Window Rate Limiter**: local admission control over a trailing
//!   time window
//! - **Retry**: exponential backoff with bounded jitter and the decision
//!   vocabulary retry policies speak
//!
//! Everything here is generic over the caller's error type and reads time
//! through [`Clock`], so tests drive a [`MockClock`] instead of sleeping.

pub mod circuit_breaker;
pub mod clock;
pub mod rate_limiter;
pub mod retry;

// Re-export circuit breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState, ConfigError, ConfigResult, MonitoredFailure, ResilienceError, ResilienceResult,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use rate_limiter::{RateLimiterConfig, SlidingWindowRateLimiter};
// Re-export retry types
pub use retry::{
    ExponentialBackoff, Jitter, RetryDecision, RetryPolicy, MAX_BACKOFF_DELAY, MAX_JITTER,
};
