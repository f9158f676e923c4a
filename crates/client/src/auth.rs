//! Credential storage and token renewal seams
//!
//! The client reads the access token from a [`CredentialStore`] on every
//! attempt and renews it through a [`TokenRefresher`] when the server answers
//! 401. Both are injected, so the surrounding application decides where
//! tokens live and how the refresh endpoint is spoken to.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::errors::ClientError;
use crate::transport::{Transport, TransportRequest};

/// Where a token is persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Lives for the current session only
    #[default]
    Session,
    /// Survives restarts
    Durable,
}

/// Access token plus an optional rotated refresh token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Trait for reading and persisting credentials
///
/// This trait allows dependency injection and testing with in-memory stores.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_token(&self) -> Option<String>;

    async fn get_refresh_token(&self) -> Option<String>;

    async fn set_token(&self, token: &str, tier: StorageTier);

    async fn set_refresh_token(&self, token: &str, tier: StorageTier);

    /// Forget every stored credential, in every tier
    async fn remove_tokens(&self);

    /// Tier currently holding the access token; refreshed tokens are written
    /// back to it.
    async fn active_tier(&self) -> StorageTier;
}

#[derive(Debug, Default)]
struct Slot {
    access: Option<String>,
    refresh: Option<String>,
}

/// [`CredentialStore`] keeping both tiers in memory
///
/// Reads prefer the session tier.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: RwLock<Slot>,
    durable: RwLock<Slot>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token pair in `tier`
    pub fn with_tokens(access: &str, refresh: Option<&str>, tier: StorageTier) -> Self {
        let store = Self::new();
        {
            let mut slot = store.slot(tier).write();
            slot.access = Some(access.to_string());
            slot.refresh = refresh.map(str::to_string);
        }
        store
    }

    fn slot(&self, tier: StorageTier) -> &RwLock<Slot> {
        match tier {
            StorageTier::Session => &self.session,
            StorageTier::Durable => &self.durable,
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_token(&self) -> Option<String> {
        self.session.read().access.clone().or_else(|| self.durable.read().access.clone())
    }

    async fn get_refresh_token(&self) -> Option<String> {
        self.session.read().refresh.clone().or_else(|| self.durable.read().refresh.clone())
    }

    async fn set_token(&self, token: &str, tier: StorageTier) {
        self.slot(tier).write().access = Some(token.to_string());
    }

    async fn set_refresh_token(&self, token: &str, tier: StorageTier) {
        self.slot(tier).write().refresh = Some(token.to_string());
    }

    async fn remove_tokens(&self) {
        *self.session.write() = Slot::default();
        *self.durable.write() = Slot::default();
    }

    async fn active_tier(&self) -> StorageTier {
        if self.session.read().access.is_some() {
            StorageTier::Session
        } else if self.durable.read().access.is_some() {
            StorageTier::Durable
        } else {
            StorageTier::default()
        }
    }
}

/// Exchanges a refresh token for new credentials
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ClientError>;
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

/// Refresh replies come bare or wrapped in `{"data": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenReply {
    Wrapped { data: TokenBody },
    Bare(TokenBody),
}

/// [`TokenRefresher`] that POSTs `{"refresh_token": ...}` straight through
/// the transport, outside the request pipeline.
pub struct TransportTokenRefresher {
    transport: Arc<dyn Transport>,
    url: Url,
    timeout: Duration,
}

impl TransportTokenRefresher {
    pub fn new(transport: Arc<dyn Transport>, url: Url, timeout: Duration) -> Self {
        Self { transport, url, timeout }
    }
}

#[async_trait]
impl TokenRefresher for TransportTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let request = TransportRequest {
            method: Method::POST,
            url: self.url.clone(),
            headers,
            body: Some(json!({ "refresh_token": refresh_token }).to_string().into_bytes()),
            timeout: self.timeout,
        };

        debug!(url = %self.url, "Refreshing access token");
        let sent = tokio::time::timeout(self.timeout, self.transport.send(request)).await;
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(ClientError::from_transport(err, self.timeout, SystemTime::now()))
            }
            Err(_) => return Err(ClientError::Timeout { timeout: self.timeout }),
        };

        if !response.is_success() {
            return Err(ClientError::from_response(&response, SystemTime::now()));
        }

        let body = match serde_json::from_slice::<TokenReply>(&response.body) {
            Ok(TokenReply::Wrapped { data }) | Ok(TokenReply::Bare(data)) => data,
            Err(err) => {
                return Err(ClientError::Decode {
                    status: response.status,
                    message: format!("invalid refresh response: {err}"),
                })
            }
        };

        Ok(TokenPair { access_token: body.access_token, refresh_token: body.refresh_token })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::RawResponse;

    fn refresh_url() -> Url {
        Url::parse("http://api.test/auth/refresh").unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_prefers_session_tier() {
        let store = MemoryCredentialStore::with_tokens("durable", Some("r1"), StorageTier::Durable);
        assert_eq!(store.active_tier().await, StorageTier::Durable);
        assert_eq!(store.get_token().await.as_deref(), Some("durable"));

        store.set_token("session", StorageTier::Session).await;
        assert_eq!(store.get_token().await.as_deref(), Some("session"));
        assert_eq!(store.active_tier().await, StorageTier::Session);
        assert_eq!(store.get_refresh_token().await.as_deref(), Some("r1"));

        store.remove_tokens().await;
        assert!(store.get_token().await.is_none());
        assert!(store.get_refresh_token().await.is_none());
    }

    #[tokio::test]
    async fn test_refresher_accepts_bare_and_wrapped_replies() {
        let transport = Arc::new(MockTransport::sequence(vec![
            Ok(RawResponse::json(200, &json!({"access_token": "a1", "refresh_token": "r2"}))),
            Ok(RawResponse::json(200, &json!({"data": {"accessToken": "a2"}}))),
        ]));
        let refresher = TransportTokenRefresher::new(
            transport.clone(),
            refresh_url(),
            Duration::from_secs(1),
        );

        let first = refresher.refresh("r1").await.unwrap();
        assert_eq!(first, TokenPair { access_token: "a1".into(), refresh_token: Some("r2".into()) });

        let second = refresher.refresh("r2").await.unwrap();
        assert_eq!(second, TokenPair { access_token: "a2".into(), refresh_token: None });

        let requests = transport.requests();
        assert_eq!(requests[0].method, Method::POST);
        assert!(requests[0].headers.get(reqwest::header::AUTHORIZATION).is_none());
        let sent: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(sent, json!({"refresh_token": "r1"}));
    }

    #[tokio::test]
    async fn test_refresher_classifies_rejections() {
        let transport = Arc::new(MockTransport::sequence(vec![
            Ok(RawResponse::json(401, &json!({"message": "refresh token revoked"}))),
            Ok(RawResponse::json(200, &json!({"unexpected": true}))),
        ]));
        let refresher =
            TransportTokenRefresher::new(transport, refresh_url(), Duration::from_secs(1));

        let err = refresher.refresh("r1").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(err.messages(), vec!["refresh token revoked"]);

        let err = refresher.refresh("r1").await.unwrap_err();
        assert_eq!(err.error_code(), "DECODE_ERROR");
    }
}
