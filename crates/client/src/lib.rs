//! Resilient HTTP client core.
//!
//! [`Client`] sits between application code and a [`Transport`] and adds:
//! - a circuit breaker that fails fast while the backend is unhealthy
//! - a sliding-window rate limiter for local admission control
//! - deduplication of concurrent identical reads
//! - single-flight token refresh with replay on 401
//! - retries with exponential backoff and `Retry-After` support
//! - keyed cancellation, graceful shutdown and per-endpoint telemetry
//!
//! Every call resolves to one [`ResponseEnvelope`].
//!
//! ```no_run
//! # async fn demo() -> courier_common::CommonResult<()> {
//! use courier_client::{Client, ClientConfig};
//!
//! let client = Client::new(ClientConfig {
//!     base_url: "https://api.example.com/v1".into(),
//!     ..ClientConfig::default()
//! })?;
//! match client.get("/users/me").await.into_result() {
//!     Ok(user) => println!("{user}"),
//!     Err(failure) => eprintln!("{}: {:?}", failure.error_code, failure.messages),
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod auth;
pub mod cancel;
pub mod client;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod refresh;
pub mod request;
pub mod response;
pub mod retry;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use auth::{
    CredentialStore, MemoryCredentialStore, StorageTier, TokenPair, TokenRefresher,
    TransportTokenRefresher,
};
pub use client::{Client, ClientBuilder, SessionExpiredHandler};
pub use config::ClientConfig;
pub use errors::{ClientError, ErrorKind};
pub use request::{Priority, RequestDescriptor, RequestOptions};
pub use response::{Failure, ResponseEnvelope};
pub use retry::HttpRetryPolicy;
pub use telemetry::{EndpointStats, PerformanceReport, RateLimiterUsage};
pub use transport::{
    RawResponse, ReqwestTransport, ReqwestTransportBuilder, Transport, TransportError,
    TransportErrorKind, TransportRequest,
};

// Resilience primitives callers configure or inspect directly
pub use courier_common::resilience::{
    CircuitBreakerConfig, CircuitState, Clock, MockClock, RateLimiterConfig, SystemClock,
};
