//! Request orchestrator
//!
//! [`Client`] composes the resilience pieces into one `execute` call:
//!
//! ```text
//! execute -> [dedup] -> rate limiter -> concurrency permit -> circuit breaker
//!         -> transport -> classify -> retry policy | token refresh | envelope
//! ```
//!
//! Every call resolves to exactly one [`ResponseEnvelope`]. All shared state
//! is owned by one client instance; clones share it.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use courier_common::error::{CommonError, CommonResult, ErrorClassification};
use courier_common::resilience::{
    CircuitBreaker, CircuitState, Clock, ResilienceError, RetryDecision, RetryPolicy,
    SlidingWindowRateLimiter, SystemClock,
};
use futures::future::FutureExt;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{
    CredentialStore, MemoryCredentialStore, TokenRefresher, TransportTokenRefresher,
};
use crate::cancel::CancelRegistry;
use crate::config::ClientConfig;
use crate::dedup::{request_key, DedupManager};
use crate::errors::ClientError;
use crate::refresh::{RefreshOutcome, TokenRefreshCoordinator};
use crate::request::RequestDescriptor;
use crate::response::{parse_payload, ResponseEnvelope};
use crate::retry::HttpRetryPolicy;
use crate::telemetry::{PerformanceMonitor, PerformanceReport, RateLimiterUsage};
use crate::transport::{ReqwestTransport, Transport, TransportRequest};

/// Callback invoked when credentials cannot be renewed
pub type SessionExpiredHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Status and payload of a successful call, or its classified failure
type Outcome = Result<(u16, Value), ClientError>;

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    refresh: TokenRefreshCoordinator,
    dedup: DedupManager<Outcome>,
    cancels: CancelRegistry,
    telemetry: PerformanceMonitor,
    breaker: CircuitBreaker<Arc<dyn Clock>>,
    limiter: SlidingWindowRateLimiter<Arc<dyn Clock>>,
    concurrency: Option<Semaphore>,
    correlation_header: HeaderName,
    clock: Arc<dyn Clock>,
    on_session_expired: Option<SessionExpiredHandler>,
    in_flight: AtomicUsize,
    shut_down: AtomicBool,
}

/// Resilient HTTP client
///
/// Cheap to clone; clones share breaker, limiter, dedup and refresh state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.config.base_url)
            .field("circuit_state", &self.inner.breaker.state())
            .finish()
    }
}

impl Client {
    /// Start building a new client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Client with the reqwest transport and an in-memory credential store.
    pub fn new(config: ClientConfig) -> CommonResult<Self> {
        Self::builder().config(config).build()
    }

    /// The validated configuration this client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Execute a request. Never fails: errors come back as a `Failure`
    /// envelope.
    #[instrument(
        skip(self, request),
        fields(method = %request.method, path = %request.path, priority = %request.options.priority)
    )]
    pub async fn execute(&self, request: RequestDescriptor) -> ResponseEnvelope {
        let started = Instant::now();
        let endpoint = endpoint_name(&request);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlightGuard(&self.inner.in_flight);

        let outcome = self.run(request).await;
        self.inner.telemetry.record(&endpoint, started.elapsed(), outcome.is_ok());

        let timestamp = self.now();
        match outcome {
            Ok((status, data)) => ResponseEnvelope::success(data, status, timestamp),
            Err(err) => {
                debug!(
                    error = %err,
                    code = %err.error_code(),
                    severity = %err.severity(),
                    "Request failed"
                );
                ResponseEnvelope::failure(&err, timestamp)
            }
        }
    }

    /// GET `path`; concurrent identical GETs share one transport call
    pub async fn get(&self, path: &str) -> ResponseEnvelope {
        self.execute(RequestDescriptor::get(path)).await
    }

    /// POST `body` as JSON
    pub async fn post(&self, path: &str, body: Value) -> ResponseEnvelope {
        self.execute(RequestDescriptor::post(path).json(body)).await
    }

    /// PUT `body` as JSON
    pub async fn put(&self, path: &str, body: Value) -> ResponseEnvelope {
        self.execute(RequestDescriptor::put(path).json(body)).await
    }

    /// PATCH `body` as JSON
    pub async fn patch(&self, path: &str, body: Value) -> ResponseEnvelope {
        self.execute(RequestDescriptor::patch(path).json(body)).await
    }

    /// DELETE `path`
    pub async fn delete(&self, path: &str) -> ResponseEnvelope {
        self.execute(RequestDescriptor::delete(path)).await
    }

    /// Whether `path` answers 2xx. Skips auth, dedup and retries.
    pub async fn health_check(&self, path: &str) -> bool {
        let request = RequestDescriptor::get(path).skip_auth().dedupe(false).retries(0);
        self.execute(request).await.is_success()
    }

    /// Cancel the request pending under `key`
    pub fn cancel(&self, key: &str) -> bool {
        self.inner.cancels.cancel(key)
    }

    /// Cancel every pending request, keyed or not; returns how many were
    /// pending. Requests issued afterwards run normally.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancels.cancel_all()
    }

    /// Force the breaker back to `Closed` with cleared counters
    pub fn reset_circuit_breaker(&self) {
        self.inner.breaker.reset();
    }

    /// Empty the local rate window
    pub fn reset_rate_limiter(&self) {
        self.inner.limiter.reset();
    }

    /// Current breaker state. After the cooldown elapses it still reads
    /// `Open` until the next call probes the server.
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Snapshot of per-endpoint stats, breaker and limiter state, and the
    /// number of requests in flight
    pub fn performance_report(&self) -> PerformanceReport {
        let metrics = self.inner.breaker.metrics();
        PerformanceReport {
            endpoints: self.inner.telemetry.snapshot(),
            circuit_state: metrics.state,
            consecutive_failures: metrics.consecutive_failures,
            rate_limiter: RateLimiterUsage {
                in_window: self.inner.limiter.current_count(),
                max_requests: self.inner.limiter.config().max_requests,
            },
            pending_requests: self.inner.in_flight.load(Ordering::Relaxed),
            generated_at: self.now(),
        }
    }

    /// Cancel everything in flight and clear all state. Later calls fail
    /// with `Aborted`.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancels.shutdown();
        self.inner.dedup.clear();
        if let Some(semaphore) = &self.inner.concurrency {
            semaphore.close();
        }
        self.inner.limiter.reset();
        self.inner.breaker.reset();
        self.inner.telemetry.reset();
        info!("Client shut down");
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.inner.clock.system_time())
    }

    async fn run(&self, request: RequestDescriptor) -> Outcome {
        if self.inner.shut_down.load(Ordering::Acquire) || request.cancel_token.is_cancelled() {
            return Err(ClientError::Aborted);
        }

        let mut url = self.inner.config.resolve_url(&request.path).map_err(|e| {
            ClientError::InvalidRequest { message: format!("invalid URL '{}': {e}", request.path) }
        })?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }

        // Keyed requests supersede older ones under the same key; every
        // request observes `cancel_all` and shutdown.
        let registration = self.inner.cancels.register(request.options.cancel_key.as_deref());
        let registered = registration.token().clone();
        let caller = request.cancel_token.clone();
        let cancelled = async {
            tokio::select! {
                () = caller.cancelled() => {}
                () = registered.cancelled() => {}
            }
        };

        if !request.should_dedupe() {
            return self.abortable(request, url, cancelled).await;
        }

        let key = request_key(&request.method, &url, &request.query, request.body.as_ref());
        let client = self.clone();
        let outcome = self
            .inner
            .dedup
            .coalesce(key, cancelled, move || {
                let token = client.inner.cancels.child_token();
                let op_token = token.clone();
                let operation = async move {
                    client.abortable(request, url, op_token.cancelled()).await
                }
                .boxed();
                (token, operation)
            })
            .await;
        outcome.unwrap_or(Err(ClientError::Aborted))
    }

    async fn abortable<C>(&self, request: RequestDescriptor, url: Url, cancelled: C) -> Outcome
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            outcome = self.attempts(request, url) => outcome,
            () = cancelled => {
                debug!("Request aborted");
                Err(ClientError::Aborted)
            }
        }
    }

    /// Attempt loop: retries, refresh-and-replay, and the final outcome.
    async fn attempts(&self, mut request: RequestDescriptor, url: Url) -> Outcome {
        let policy = HttpRetryPolicy::for_request(&self.inner.config, &request.options);
        let timeout = request.options.timeout.unwrap_or(self.inner.config.timeout);
        let mut renewed_token: Option<String> = None;

        loop {
            let token = if request.options.skip_auth {
                None
            } else if let Some(token) = renewed_token.take() {
                Some(token)
            } else {
                self.inner.credentials.get_token().await
            };

            let correlation_id = Uuid::new_v4().to_string();
            debug!(%url, %correlation_id, attempt = request.attempt, "Dispatching request");

            let err = match self
                .attempt(&request, &url, token.as_deref(), &correlation_id, timeout)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            if err.is_unauthorized() {
                let Some(sent) = token.as_deref() else {
                    return Err(err);
                };
                if request.auth_retried || self.inner.config.is_auth_path(&url) {
                    return Err(err);
                }
                request.auth_retried = true;

                match self.inner.refresh.refresh_for(sent).await {
                    RefreshOutcome::Refreshed { token, .. } | RefreshOutcome::Replay(token) => {
                        debug!(%correlation_id, "Replaying request with renewed credentials");
                        renewed_token = Some(token);
                        continue;
                    }
                    RefreshOutcome::Failed { error, leader } => {
                        if leader {
                            self.notify_session_expired(&error);
                        }
                        return Err(error);
                    }
                }
            }

            match policy.should_retry(&err, request.attempt) {
                RetryDecision::Stop => return Err(err),
                decision => {
                    let delay = decision.delay().unwrap_or(Duration::ZERO);
                    request.attempt += 1;
                    debug!(
                        %correlation_id,
                        attempt = request.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One hop through admission control, the breaker and the transport.
    async fn attempt(
        &self,
        request: &RequestDescriptor,
        url: &Url,
        token: Option<&str>,
        correlation_id: &str,
        timeout: Duration,
    ) -> Outcome {
        if !self.inner.limiter.try_admit() {
            let retry_after = self.inner.limiter.next_available_delay();
            warn!(
                retry_after_ms = retry_after.as_millis() as u64,
                "Request rejected by local rate limiter"
            );
            return Err(ClientError::RateLimitedLocal { retry_after });
        }

        let _permit = match &self.inner.concurrency {
            Some(semaphore) => {
                Some(semaphore.acquire().await.map_err(|_| ClientError::Aborted)?)
            }
            None => None,
        };

        let transport_request =
            self.transport_request(request, url, token, correlation_id, timeout)?;
        let transport = Arc::clone(&self.inner.transport);
        let now = self.inner.clock.system_time();

        let result = self
            .inner
            .breaker
            .execute(move || async move {
                match tokio::time::timeout(timeout, transport.send(transport_request)).await {
                    Ok(Ok(response)) if response.is_success() => Ok(response),
                    Ok(Ok(response)) => Err(ClientError::from_response(&response, now)),
                    Ok(Err(err)) => Err(ClientError::from_transport(err, timeout, now)),
                    Err(_) => Err(ClientError::Timeout { timeout }),
                }
            })
            .await;

        match result {
            Ok(response) => {
                debug!(correlation_id, status = response.status, "Request succeeded");
                Ok((response.status, parse_payload(&response.body)))
            }
            Err(ResilienceError::CircuitOpen { retry_after }) => {
                warn!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request rejected, circuit breaker open"
                );
                Err(ClientError::CircuitOpen { retry_after })
            }
            Err(ResilienceError::RateLimited { retry_after }) => {
                Err(ClientError::RateLimitedLocal { retry_after })
            }
            Err(ResilienceError::OperationFailed { source }) => {
                debug!(correlation_id, status = ?source.status(), error = %source, "Attempt failed");
                Err(source)
            }
        }
    }

    fn transport_request(
        &self,
        request: &RequestDescriptor,
        url: &Url,
        token: Option<&str>,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<TransportRequest, ClientError> {
        let invalid = |message: String| ClientError::InvalidRequest { message };

        let mut headers = request.headers.clone();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| invalid(format!("invalid access token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let correlation = HeaderValue::from_str(correlation_id)
            .map_err(|e| invalid(format!("invalid correlation id: {e}")))?;
        headers.insert(self.inner.correlation_header.clone(), correlation);
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        let body = match &request.body {
            Some(body) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Some(
                    serde_json::to_vec(body)
                        .map_err(|e| invalid(format!("unserializable body: {e}")))?,
                )
            }
            None => None,
        };

        Ok(TransportRequest {
            method: request.method.clone(),
            url: url.clone(),
            headers,
            body,
            timeout,
        })
    }

    fn notify_session_expired(&self, error: &ClientError) {
        warn!(error = %error, "Session expired, credentials cleared");
        if let Some(handler) = &self.inner.on_session_expired {
            handler(error);
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// `"METHOD /path"` with any query string stripped
fn endpoint_name(request: &RequestDescriptor) -> String {
    if let Some(label) = &request.options.endpoint {
        return label.clone();
    }
    let path = request.path.split('?').next().unwrap_or_default();
    format!("{} {path}", request.method)
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    on_session_expired: Option<SessionExpiredHandler>,
    clock: Option<Arc<dyn Clock>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport to send requests through (default: [`ReqwestTransport`])
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Credential store (default: empty [`MemoryCredentialStore`])
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Token refresher (default: [`TransportTokenRefresher`] against
    /// `refresh_path`)
    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn on_session_expired<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.on_session_expired = Some(Arc::new(handler));
        self
    }

    /// Clock for the breaker and limiter (default: system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> CommonResult<Client> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let credentials: Arc<dyn CredentialStore> =
            self.credentials.unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
        let refresher: Arc<dyn TokenRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => {
                let url = config.resolve_url(&config.refresh_path).map_err(|e| {
                    CommonError::config_field("refresh_path", e.to_string())
                })?;
                Arc::new(TransportTokenRefresher::new(Arc::clone(&transport), url, config.timeout))
            }
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let breaker = CircuitBreaker::with_clock(config.circuit_breaker.clone(), Arc::clone(&clock))?;
        let limiter =
            SlidingWindowRateLimiter::with_clock(config.rate_limiter.clone(), Arc::clone(&clock))?;
        let correlation_header = HeaderName::from_str(&config.correlation_header)
            .map_err(|e| CommonError::config_field("correlation_header", e.to_string()))?;

        info!(
            base_url = %config.base_url,
            timeout_ms = config.timeout.as_millis() as u64,
            max_retries = config.max_retries,
            "Client configured"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                refresh: TokenRefreshCoordinator::new(Arc::clone(&credentials), refresher),
                concurrency: config.max_concurrent_requests.map(Semaphore::new),
                config,
                transport,
                credentials,
                dedup: DedupManager::new(),
                cancels: CancelRegistry::new(),
                telemetry: PerformanceMonitor::new(),
                breaker,
                limiter,
                correlation_header,
                clock,
                on_session_expired: self.on_session_expired,
                in_flight: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}
