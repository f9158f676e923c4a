#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_client::{
    Client, ClientConfig, MemoryCredentialStore, MockClock, RawResponse, StorageTier,
    TransportRequest,
};
use courier_client::testing::MockTransport;
use reqwest::header::AUTHORIZATION;
use serde_json::json;

pub const BASE_URL: &str = "http://api.test";

/// Route client logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        base_url: BASE_URL.to_string(),
        retry_base_delay: Duration::from_millis(1),
        ..ClientConfig::default()
    }
}

/// Client over `transport` holding access token `t1` and refresh token `r1`.
pub fn client_with(transport: Arc<MockTransport>, config: ClientConfig) -> Client {
    Client::builder()
        .config(config)
        .transport(transport)
        .credential_store(Arc::new(MemoryCredentialStore::with_tokens(
            "t1",
            Some("r1"),
            StorageTier::Session,
        )))
        .build()
        .expect("client should build")
}

/// Like [`client_with`] but driven by a mock clock.
pub fn client_with_clock(
    transport: Arc<MockTransport>,
    config: ClientConfig,
    clock: Arc<MockClock>,
) -> Client {
    Client::builder()
        .config(config)
        .transport(transport)
        .clock(clock)
        .build()
        .expect("client should build")
}

/// Bearer token a recorded request carried, if any.
pub fn bearer(request: &TransportRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Server that accepts only `accepted` tokens and answers `/auth/refresh`
/// with `refreshed` (or 401 when `None`).
pub fn auth_server(
    accepted: &'static str,
    refreshed: Option<&'static str>,
) -> impl Fn(&TransportRequest) -> Result<RawResponse, courier_client::TransportError> {
    move |request| {
        if request.url.path() == "/auth/refresh" {
            return Ok(match refreshed {
                Some(token) => RawResponse::json(200, &json!({"access_token": token})),
                None => RawResponse::json(401, &json!({"message": "refresh token revoked"})),
            });
        }
        if bearer(request).as_deref() == Some(accepted) {
            Ok(RawResponse::json(200, &json!({"path": request.url.path()})))
        } else {
            Ok(RawResponse::json(401, &json!({"message": "token expired"})))
        }
    }
}
