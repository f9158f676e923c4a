//! Circuit breaker for failure containment
//!
//! The breaker wraps a unit of work and tracks how often it fails with a
//! *monitored* failure (by default: any server-error status). Once
//! `failure_threshold` consecutive monitored failures accumulate, calls fail
//! fast until `reset_timeout` has elapsed, after which a bounded number of
//! probe calls decide whether the dependency has recovered.
//!
//! ```text
//! Closed   --(threshold reached)--------------> Open
//! Open     --(reset_timeout elapsed, next call)-> HalfOpen
//! HalfOpen --(probe quota met)------------------> Closed
//! HalfOpen --(probe failed / quota missed)-----> Open
//! ```
//!
//! All state lives behind a single mutex, so transitions are linearized:
//! two concurrent failures can never both flip Closed to Open.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};

//==============================================================================
// Error Types
//==============================================================================

/// Simple configuration error for validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by the resilience gates
///
/// Generic over the wrapped operation's error so the original failure is
/// preserved untouched in [`ResilienceError::OperationFailed`].
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit breaker is open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Local admission control rejected the call
    #[error("Rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Exposes the status code a failure was classified with.
///
/// The breaker only counts failures whose status is in the configured
/// monitored set; failures without a status (or with an unmonitored one)
/// leave the failure counter untouched.
pub trait MonitoredFailure {
    /// Status code the failure carries, if any
    fn status_code(&self) -> Option<u16>;
}

//==============================================================================
// Configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
///
/// With the `serde` feature, durations are (de)serialized as milliseconds and
/// missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerConfig {
    /// Consecutive monitored failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    #[cfg_attr(feature = "serde", serde(with = "crate::utils::serde::duration_millis"))]
    pub reset_timeout: Duration,
    /// Probe calls allowed (and successes required) in half-open state
    pub half_open_requests: u32,
    /// Status codes that count as breaker failures
    pub monitored_status_codes: BTreeSet<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 3,
            monitored_status_codes: (500..=599).collect(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.half_open_requests == 0 {
            return Err(ConfigError::invalid("half_open_requests must be greater than 0"));
        }

        if self.reset_timeout.is_zero() {
            return Err(ConfigError::invalid("reset_timeout must be greater than zero"));
        }

        Ok(())
    }

    /// Whether a failure with this status trips the breaker
    pub fn is_monitored(&self, status: u16) -> bool {
        self.monitored_status_codes.contains(&status)
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_requests(mut self, requests: u32) -> Self {
        self.config.half_open_requests = requests;
        self
    }

    pub fn monitored_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.config.monitored_status_codes = codes.into_iter().collect();
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Breaker
//==============================================================================

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probes: u32,
    pub half_open_successes: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_probes: u32,
    half_open_successes: u32,
    half_open_completed: u32,
    /// Bumped on every transition so stale probe outcomes are ignored.
    epoch: u64,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            opened_at: None,
            half_open_probes: 0,
            half_open_successes: 0,
            half_open_completed: 0,
            epoch: 0,
            total_calls: 0,
            rejected_calls: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.epoch += 1;
        self.half_open_probes = 0;
        self.half_open_successes = 0;
        self.half_open_completed = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Admission ticket for one call through the breaker.
///
/// A permit that is dropped without an outcome (the caller's future was
/// cancelled) hands its half-open probe slot back instead of leaking it.
struct CallPermit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    epoch: u64,
    probe: bool,
    settled: bool,
}

impl<C: Clock> CallPermit<'_, C> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.epoch, self.probe);
    }

    fn fail(mut self, monitored: bool) {
        self.settled = true;
        self.breaker.on_failure(self.epoch, self.probe, monitored);
    }
}

impl<C: Clock> Drop for CallPermit<'_, C> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.epoch);
        }
    }
}

/// Three-state circuit breaker
///
/// Cloning is cheap and clones share state.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerState::new())),
            clock: Arc::new(clock),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejected calls never invoke `operation`.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: MonitoredFailure + std::error::Error + Send + Sync + 'static,
    {
        let permit = self
            .acquire()
            .map_err(|retry_after| ResilienceError::CircuitOpen { retry_after })?;

        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(error) => {
                let monitored = error.status_code().is_some_and(|s| self.config.is_monitored(s));
                debug!(monitored, status = ?error.status_code(), "Circuit breaker: operation failed");
                permit.fail(monitored);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Whether a call issued now would be admitted, without consuming a
    /// probe slot or transitioning state.
    pub fn can_execute(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_remaining(&inner).is_zero(),
            CircuitState::HalfOpen => inner.half_open_probes < self.config.half_open_requests,
        }
    }

    fn acquire(&self) -> Result<CallPermit<'_, C>, Duration> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        if inner.state == CircuitState::Open {
            let remaining = self.cooldown_remaining(&inner);
            if !remaining.is_zero() {
                inner.rejected_calls += 1;
                debug!(remaining_ms = remaining.as_millis() as u64, "Circuit breaker rejecting call");
                return Err(remaining);
            }
            inner.transition(CircuitState::HalfOpen, now);
            info!("Circuit breaker half-open, admitting probe calls");
        }

        let probe = inner.state == CircuitState::HalfOpen;
        if probe {
            if inner.half_open_probes >= self.config.half_open_requests {
                inner.rejected_calls += 1;
                debug!("Circuit breaker rejecting call, all probes in flight");
                return Err(Duration::ZERO);
            }
            inner.half_open_probes += 1;
        }

        inner.total_calls += 1;
        Ok(CallPermit { breaker: self, epoch: inner.epoch, probe, settled: false })
    }

    fn cooldown_remaining(&self, inner: &BreakerState) -> Duration {
        match inner.opened_at {
            Some(opened_at) => {
                let elapsed = self.clock.now().saturating_duration_since(opened_at);
                self.config.reset_timeout.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    fn on_success(&self, epoch: u64, probe: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                // Slow recovery: one success forgives one failure.
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen if probe && inner.epoch == epoch => {
                inner.half_open_successes += 1;
                inner.half_open_completed += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    let now = self.clock.now();
                    inner.transition(CircuitState::Closed, now);
                    info!(
                        probes = self.config.half_open_requests,
                        "Circuit breaker closed after successful probes"
                    );
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, epoch: u64, probe: bool, monitored: bool) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        if !monitored {
            if inner.state == CircuitState::HalfOpen && probe && inner.epoch == epoch {
                inner.half_open_completed += 1;
                self.settle_half_open(&mut inner, now);
            }
            return;
        }

        inner.last_failure_time = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.transition(CircuitState::Open, now);
                    warn!(failures, "Circuit breaker opened");
                }
            }
            CircuitState::HalfOpen if probe && inner.epoch == epoch => {
                inner.transition(CircuitState::Open, now);
                warn!("Circuit breaker reopened, half-open probe failed");
            }
            _ => {}
        }
    }

    /// Reopen once every probe has reported and the quota was missed.
    fn settle_half_open(&self, inner: &mut BreakerState, now: Instant) {
        if inner.half_open_completed >= self.config.half_open_requests
            && inner.half_open_successes < self.config.half_open_requests
        {
            inner.transition(CircuitState::Open, now);
            warn!(
                successes = inner.half_open_successes,
                "Circuit breaker reopened, probe quota not met"
            );
        }
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.epoch == epoch {
            inner.half_open_probes = inner.half_open_probes.saturating_sub(1);
        }
    }

    /// Current state (does not perform the Open -> HalfOpen transition)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Remaining cooldown while open, zero otherwise
    pub fn remaining_cooldown(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            self.cooldown_remaining(&inner)
        } else {
            Duration::ZERO
        }
    }

    /// Snapshot of breaker counters
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_probes: inner.half_open_probes,
            half_open_successes: inner.half_open_successes,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure_time,
            opened_at: inner.opened_at,
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::new();
        info!("Circuit breaker manually reset to closed state");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::resilience::MockClock;

    #[derive(Debug, Error)]
    #[error("status {0}")]
    struct StatusError(u16);

    impl MonitoredFailure for StatusError {
        fn status_code(&self) -> Option<u16> {
            Some(self.0)
        }
    }

    fn breaker(threshold: u32, probes: u32) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .half_open_requests(probes)
            .reset_timeout(Duration::from_secs(30))
            .build()
            .expect("valid config");
        let cb = CircuitBreaker::with_clock(config, clock.clone()).expect("valid breaker");
        (cb, clock)
    }

    async fn fail(cb: &CircuitBreaker<MockClock>, status: u16) -> ResilienceResult<(), StatusError> {
        cb.execute(|| async move { Err(StatusError(status)) }).await
    }

    async fn succeed(cb: &CircuitBreaker<MockClock>) -> ResilienceResult<(), StatusError> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_config_defaults_monitor_server_errors() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.half_open_requests, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert!(config.is_monitored(500));
        assert!(config.is_monitored(503));
        assert!(!config.is_monitored(404));
        assert!(!config.is_monitored(429));
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_requests(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().reset_timeout(Duration::ZERO).build().is_err());
        assert!(CircuitBreakerConfig::builder().build().is_ok());
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let (cb, _clock) = breaker(3, 1);

        for _ in 0..2 {
            assert!(fail(&cb, 500).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(fail(&cb, 502).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: ResilienceResult<(), StatusError> = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match result {
            Err(ResilienceError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open breaker must not run the operation");
        assert_eq!(cb.metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_unmonitored_failures_do_not_trip() {
        let (cb, _clock) = breaker(2, 1);

        for _ in 0..10 {
            let _ = fail(&cb, 404).await;
            let _ = fail(&cb, 400).await;
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_success_decays_failure_count_by_one() {
        let (cb, _clock) = breaker(5, 1);

        for _ in 0..3 {
            let _ = fail(&cb, 500).await;
        }
        assert_eq!(cb.metrics().consecutive_failures, 3);

        succeed(&cb).await.expect("closed breaker admits");
        assert_eq!(cb.metrics().consecutive_failures, 2);

        succeed(&cb).await.expect("closed breaker admits");
        succeed(&cb).await.expect("closed breaker admits");
        succeed(&cb).await.expect("closed breaker admits");
        assert_eq!(cb.metrics().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_remaining_cooldown_shrinks() {
        let (cb, clock) = breaker(1, 1);
        let _ = fail(&cb, 500).await;

        clock.advance(Duration::from_secs(10));
        assert_eq!(cb.remaining_cooldown(), Duration::from_secs(20));

        match succeed(&cb).await {
            Err(ResilienceError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(20));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_half_open_closes_after_probe_quota() {
        let (cb, clock) = breaker(1, 2);
        let _ = fail(&cb, 500).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(31));
        assert!(cb.can_execute());

        succeed(&cb).await.expect("first probe admitted");
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.expect("second probe admitted");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let (cb, clock) = breaker(1, 3);
        let _ = fail(&cb, 500).await;
        clock.advance(Duration::from_secs(31));

        succeed(&cb).await.expect("probe admitted");
        assert!(fail(&cb, 503).await.is_err());

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.remaining_cooldown(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_half_open_unmonitored_outcome_misses_quota() {
        let (cb, clock) = breaker(1, 2);
        let _ = fail(&cb, 500).await;
        clock.advance(Duration::from_secs(31));

        succeed(&cb).await.expect("probe admitted");
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb, 404).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_rejects_beyond_probe_quota() {
        let (cb, clock) = breaker(1, 1);
        let _ = fail(&cb, 500).await;
        clock.advance(Duration::from_secs(31));

        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async move {
                    let _ = gate_rx.await;
                    Ok::<_, StatusError>(())
                })
                .await
        });

        tokio::task::yield_now().await;
        while cb.metrics().half_open_probes == 0 {
            tokio::task::yield_now().await;
        }

        match succeed(&cb).await {
            Err(ResilienceError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::ZERO);
            }
            other => panic!("expected rejection while probe in flight, got {other:?}"),
        }

        gate_tx.send(()).expect("probe still waiting");
        probe.await.expect("probe task").expect("probe succeeded");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_probe_returns_its_slot() {
        let (cb, clock) = breaker(1, 1);
        let _ = fail(&cb, 500).await;
        clock.advance(Duration::from_secs(31));

        let pending = cb.execute(|| std::future::pending::<Result<(), StatusError>>());
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), pending).await.is_err();
        assert!(timed_out);

        assert_eq!(cb.metrics().half_open_probes, 0);
        succeed(&cb).await.expect("slot was released");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let (cb, _clock) = breaker(1, 1);
        let _ = fail(&cb, 500).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.metrics().total_calls, 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_once() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .build()
            .expect("valid config");
        let cb = CircuitBreaker::with_clock(config, clock).expect("valid breaker");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                let _ = cb.execute(|| async { Err::<(), _>(StatusError(500)) }).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_calls, 10, "calls after opening are rejected");
        assert_eq!(metrics.rejected_calls, 40);
    }
}
