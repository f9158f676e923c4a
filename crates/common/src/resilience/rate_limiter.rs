//! Sliding-window rate limiting
//!
//! Admission control that counts events within a trailing window rather than
//! fixed buckets. Each admission check first prunes timestamps that have left
//! the window, so the retained log never holds anything older than `window`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::circuit_breaker::{ConfigError, ConfigResult};
use super::clock::{Clock, SystemClock};

/// Configuration for the sliding-window limiter
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RateLimiterConfig {
    /// Maximum admissions within one window
    pub max_requests: u32,
    /// Length of the trailing window
    #[cfg_attr(feature = "serde", serde(with = "crate::utils::serde::duration_millis"))]
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { max_requests: 100, window: Duration::from_secs(60) }
    }
}

impl RateLimiterConfig {
    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("max_requests must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window must be greater than zero"));
        }
        Ok(())
    }
}

/// Sliding-window rate limiter
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use courier_common::resilience::{RateLimiterConfig, SlidingWindowRateLimiter};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = SlidingWindowRateLimiter::new(RateLimiterConfig {
///     max_requests: 2,
///     window: Duration::from_secs(1),
/// })?;
///
/// assert!(limiter.try_admit());
/// assert!(limiter.try_admit());
/// assert!(!limiter.try_admit());
/// # Ok(())
/// # }
/// ```
pub struct SlidingWindowRateLimiter<C: Clock = SystemClock> {
    config: RateLimiterConfig,
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for SlidingWindowRateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindowRateLimiter")
            .field("config", &self.config)
            .field("in_window", &self.timestamps.lock().len())
            .finish()
    }
}

impl<C: Clock> Clone for SlidingWindowRateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            timestamps: Arc::clone(&self.timestamps),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl SlidingWindowRateLimiter<SystemClock> {
    /// Create a new limiter with the system clock
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> SlidingWindowRateLimiter<C> {
    /// Create a new limiter with a custom clock
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            timestamps: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_requests as usize))),
            config,
            clock: Arc::new(clock),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn prune(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an admission if the window has room.
    ///
    /// Returns `false` (and records nothing) when the window is full.
    pub fn try_admit(&self) -> bool {
        let now = self.clock.now();
        let mut log = self.timestamps.lock();
        self.prune(&mut log, now);

        if log.len() < self.config.max_requests as usize {
            log.push_back(now);
            true
        } else {
            debug!(
                in_window = log.len(),
                max_requests = self.config.max_requests,
                "Rate limit: window full"
            );
            false
        }
    }

    /// Time until the oldest retained timestamp leaves the window.
    ///
    /// Zero when the window is empty.
    pub fn next_available_delay(&self) -> Duration {
        let now = self.clock.now();
        let mut log = self.timestamps.lock();
        self.prune(&mut log, now);

        match log.front() {
            Some(oldest) => {
                self.config.window.saturating_sub(now.saturating_duration_since(*oldest))
            }
            None => Duration::ZERO,
        }
    }

    /// Admissions currently inside the window
    pub fn current_count(&self) -> usize {
        let now = self.clock.now();
        let mut log = self.timestamps.lock();
        self.prune(&mut log, now);
        log.len()
    }

    /// Forget every recorded admission
    pub fn reset(&self) {
        self.timestamps.lock().clear();
    }
}
