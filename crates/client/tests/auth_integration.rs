//! Integration tests for token refresh
//!
//! A burst of requests hitting 401 must produce exactly one refresh; every
//! request is then replayed with the new token, or every request fails and
//! credentials are cleared.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_client::testing::MockTransport;
use courier_client::{
    Client, CredentialStore, ErrorKind, MemoryCredentialStore, RequestDescriptor, StorageTier,
};
use support::{auth_server, bearer, fast_config, init_tracing};

fn store(tier: StorageTier) -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with_tokens("t1", Some("r1"), tier))
}

#[tokio::test]
async fn test_concurrent_401s_refresh_once_and_replay() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::new(auth_server("t2", Some("t2"))).with_delay(Duration::from_millis(30)),
    );
    let credentials = store(StorageTier::Durable);
    let client = Client::builder()
        .config(fast_config())
        .transport(transport.clone())
        .credential_store(credentials.clone())
        .build()
        .expect("client should build");

    let (a, b, c) = tokio::join!(client.get("/a"), client.get("/b"), client.get("/c"));

    for envelope in [&a, &b, &c] {
        assert!(envelope.is_success(), "{envelope:?}");
    }
    assert_eq!(transport.count_path("/auth/refresh"), 1);
    for path in ["/a", "/b", "/c"] {
        assert_eq!(transport.count_path(path), 2);
    }

    // Replays carried the renewed token; it was persisted in the durable tier.
    let replayed: Vec<_> = transport
        .requests()
        .iter()
        .filter(|r| r.url.path() != "/auth/refresh")
        .filter_map(bearer)
        .filter(|token| token == "t2")
        .collect();
    assert_eq!(replayed.len(), 3);
    assert_eq!(credentials.get_token().await.as_deref(), Some("t2"));
    assert_eq!(credentials.active_tier().await, StorageTier::Durable);
}

#[tokio::test]
async fn test_refresh_request_carries_refresh_token() {
    let transport = Arc::new(MockTransport::new(auth_server("t2", Some("t2"))));
    let client = Client::builder()
        .config(fast_config())
        .transport(transport.clone())
        .credential_store(store(StorageTier::Session))
        .build()
        .expect("client should build");

    assert!(client.get("/profile").await.is_success());

    let refresh = transport
        .requests()
        .into_iter()
        .find(|r| r.url.path() == "/auth/refresh")
        .expect("refresh request sent");
    let body: serde_json::Value =
        serde_json::from_slice(refresh.body.as_deref().unwrap_or_default()).expect("json body");
    assert_eq!(body["refresh_token"], "r1");
    assert!(bearer(&refresh).is_none());
}

#[tokio::test]
async fn test_failed_refresh_fails_every_waiter_and_clears_credentials() {
    init_tracing();
    let transport = Arc::new(
        MockTransport::new(auth_server("t2", None)).with_delay(Duration::from_millis(30)),
    );
    let credentials = store(StorageTier::Session);
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let client = Client::builder()
        .config(fast_config())
        .transport(transport.clone())
        .credential_store(credentials.clone())
        .on_session_expired(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("client should build");

    let (a, b, c) = tokio::join!(client.get("/a"), client.get("/b"), client.get("/c"));

    let mut codes = Vec::new();
    for envelope in [a, b, c] {
        let failure = envelope.into_result().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SessionExpired);
        assert_eq!(failure.status_code, Some(401));
        codes.push(failure.error_code);
    }
    assert_eq!(codes.iter().filter(|code| *code == "SESSION_EXPIRED").count(), 1);
    assert_eq!(transport.count_path("/auth/refresh"), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(credentials.get_token().await.is_none());
    assert!(credentials.get_refresh_token().await.is_none());
}

#[tokio::test]
async fn test_replayed_401_is_not_refreshed_again() {
    // The server rejects every token, including the renewed one.
    let transport = Arc::new(MockTransport::new(auth_server("never", Some("t2"))));
    let client = Client::builder()
        .config(fast_config())
        .transport(transport.clone())
        .credential_store(store(StorageTier::Session))
        .build()
        .expect("client should build");

    let failure = client.get("/a").await.into_result().unwrap_err();
    assert_eq!(failure.status_code, Some(401));
    assert_eq!(failure.kind, ErrorKind::Api);
    assert_eq!(transport.count_path("/a"), 2);
    assert_eq!(transport.count_path("/auth/refresh"), 1);
}

#[tokio::test]
async fn test_auth_endpoints_never_trigger_refresh() {
    let transport = Arc::new(MockTransport::new(auth_server("t2", Some("t2"))));
    let client = Client::builder()
        .config(fast_config())
        .transport(transport.clone())
        .credential_store(store(StorageTier::Session))
        .build()
        .expect("client should build");

    let failure = client.get("/auth/me").await.into_result().unwrap_err();
    assert_eq!(failure.status_code, Some(401));
    assert_eq!(transport.count_path("/auth/refresh"), 0);
}

#[tokio::test]
async fn test_unauthenticated_request_401_passes_through() {
    let transport = Arc::new(MockTransport::new(auth_server("t2", Some("t2"))));
    let client = Client::builder()
        .config(fast_config())
        .transport(transport.clone())
        .credential_store(store(StorageTier::Session))
        .build()
        .expect("client should build");

    let failure = client
        .execute(RequestDescriptor::get("/public").skip_auth())
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(failure.status_code, Some(401));
    assert_eq!(transport.count_path("/auth/refresh"), 0);
}
