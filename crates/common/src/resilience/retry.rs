//! Retry decisions and exponential backoff with bounded jitter
//!
//! This module holds the domain-free half of retry handling: the decision
//! vocabulary shared by retry policies, and the delay arithmetic. Policies
//! that know about a particular error type (HTTP status classes, server
//! advisory headers) live with that error type and implement
//! [`RetryPolicy`].

use std::time::Duration;

use rand::Rng;

use super::circuit_breaker::{ConfigError, ConfigResult};

/// Upper bound for any computed backoff delay, jitter included.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(30);

/// Upper bound for the random component added to a backoff delay.
pub const MAX_JITTER: Duration = Duration::from_secs(1);

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry immediately
    Retry,
    /// Retry after waiting for the given delay
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

impl RetryDecision {
    /// Whether this decision schedules another attempt
    pub fn is_retry(&self) -> bool {
        !matches!(self, Self::Stop)
    }

    /// Delay before the next attempt, if one is scheduled
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry => Some(Duration::ZERO),
            Self::RetryAfter(delay) => Some(*delay),
            Self::Stop => None,
        }
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide what to do after `attempt` retries have already been spent
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Jitter type for adding randomness to retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter
    None,
    /// Additive jitter drawn from `[0, min(max, delay))`
    ///
    /// Bounding the jitter by the un-jittered delay keeps the sequence
    /// strictly increasing: attempt `n` never exceeds `2 * delay(n)`, which
    /// is attempt `n + 1`'s floor.
    Bounded { max: Duration },
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Bounded { max } => {
                let ceiling = (*max).min(delay).as_millis() as u64;
                if ceiling == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rng.gen_range(0..ceiling))
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt` plus jitter, capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter: Jitter,
}

impl Default for ExponentialBackoff {
    /// One second base, one second of jitter, 30 second cap
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: MAX_BACKOFF_DELAY,
            jitter: Jitter::Bounded { max: MAX_JITTER },
        }
    }
}

impl ExponentialBackoff {
    /// Backoff doubling from `base`, with up to one second of jitter and a
    /// 30 second cap.
    pub fn new(base: Duration) -> ConfigResult<Self> {
        Self::with_limits(base, MAX_BACKOFF_DELAY, Jitter::Bounded { max: MAX_JITTER })
    }

    /// Backoff with explicit cap and jitter
    pub fn with_limits(base: Duration, max_delay: Duration, jitter: Jitter) -> ConfigResult<Self> {
        if base.is_zero() {
            return Err(ConfigError::invalid("backoff base delay must be greater than zero"));
        }
        if base > max_delay {
            return Err(ConfigError::invalid(format!(
                "backoff base delay {base:?} exceeds the maximum delay {max_delay:?}"
            )));
        }
        Ok(Self { base, max_delay, jitter })
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Un-jittered, uncapped delay for `attempt` (0-based), saturating.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    /// Delay for `attempt` (0-based) using the thread-local RNG
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay for `attempt` (0-based) using the supplied RNG
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.raw_delay(attempt);
        self.jitter.apply(raw, rng).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_retry_decision_helpers() {
        assert_eq!(RetryDecision::Retry.delay(), Some(Duration::ZERO));
        assert_eq!(
            RetryDecision::RetryAfter(Duration::from_secs(2)).delay(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(RetryDecision::Stop.delay(), None);
        assert!(!RetryDecision::Stop.is_retry());
    }

    #[test]
    fn test_rejects_invalid_base() {
        assert!(ExponentialBackoff::new(Duration::ZERO).is_err());
        assert!(ExponentialBackoff::new(Duration::from_secs(31)).is_err());
        assert!(ExponentialBackoff::new(Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_raw_delay_doubles() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100)).expect("valid");
        assert_eq!(backoff.raw_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.raw_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.raw_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff.raw_delay(64), Duration::from_millis(100).saturating_mul(u32::MAX));
    }

    #[test]
    fn test_delay_bounds_hold_for_every_attempt() {
        let mut rng = StdRng::seed_from_u64(7);
        for base_ms in [1_u64, 50, 250, 1_000, 5_000, 30_000] {
            let base = Duration::from_millis(base_ms);
            let backoff = ExponentialBackoff::new(base).expect("valid");
            for attempt in 0..40 {
                let delay = backoff.delay_with(attempt, &mut rng);
                assert!(delay >= base, "attempt {attempt}: {delay:?} below base {base:?}");
                assert!(delay <= MAX_BACKOFF_DELAY, "attempt {attempt}: {delay:?} above cap");
            }
        }
    }

    #[test]
    fn test_delay_strictly_increases_before_cap() {
        let mut rng = StdRng::seed_from_u64(42);
        for base_ms in [10_u64, 300, 900, 2_000] {
            let backoff = ExponentialBackoff::new(Duration::from_millis(base_ms)).expect("valid");
            for _ in 0..200 {
                let mut previous = backoff.delay_with(0, &mut rng);
                for attempt in 1..12 {
                    let delay = backoff.delay_with(attempt, &mut rng);
                    if delay == MAX_BACKOFF_DELAY {
                        break;
                    }
                    assert!(
                        delay > previous,
                        "base {base_ms}ms attempt {attempt}: {delay:?} <= {previous:?}"
                    );
                    previous = delay;
                }
            }
        }
    }

    #[test]
    fn test_jitter_is_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        let jitter = Jitter::Bounded { max: MAX_JITTER };
        for _ in 0..1_000 {
            let delay = jitter.apply(Duration::from_secs(10), &mut rng);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay < Duration::from_secs(11));
        }
        assert_eq!(Jitter::None.apply(Duration::from_secs(3), &mut rng), Duration::from_secs(3));
    }
}
