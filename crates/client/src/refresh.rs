//! Single-flight token refresh
//!
//! Many requests can hit 401 at once. The first one to report starts the
//! refresh; everyone arriving while it runs awaits the same shared future
//! instead of starting another. The refresh itself runs on its own task so
//! it completes (and persists or clears credentials) even if the request
//! that started it is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, TokenRefresher};
use crate::errors::ClientError;

type SharedRefresh = Shared<BoxFuture<'static, Result<String, ClientError>>>;
type Slot = Arc<Mutex<Option<(u64, SharedRefresh)>>>;

/// What a request that received 401 should do next
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// Credentials were renewed; replay with `token`
    Refreshed { token: String, leader: bool },
    /// The request was sent with a token that has since been replaced;
    /// replay with the current one without refreshing
    Replay(String),
    /// Renewal failed and credentials were cleared.
    ///
    /// The request that started the refresh gets `SessionExpired`; requests
    /// that joined it get `TokenRefreshFailed`.
    Failed { error: ClientError, leader: bool },
}

/// Ensures at most one refresh runs at a time
pub struct TokenRefreshCoordinator {
    credentials: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    in_flight: Slot,
    next_id: AtomicU64,
    refreshes: Arc<AtomicU64>,
}

impl TokenRefreshCoordinator {
    pub fn new(credentials: Arc<dyn CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            credentials,
            refresher,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle a 401 for a request that was sent with `sent_token`
    pub async fn refresh_for(&self, sent_token: &str) -> RefreshOutcome {
        let (refresh, leader) = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some((_, refresh)) => {
                    debug!("Token refresh in progress, waiting for it");
                    (refresh.clone(), false)
                }
                None => match self.credentials.get_token().await {
                    None => {
                        return RefreshOutcome::Failed {
                            error: ClientError::TokenRefreshFailed {
                                message: "credentials were cleared".to_string(),
                            },
                            leader: false,
                        };
                    }
                    Some(current) if current != sent_token => {
                        debug!("Token already replaced, replaying request");
                        return RefreshOutcome::Replay(current);
                    }
                    Some(_) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let refresh = self.start(id);
                        *slot = Some((id, refresh.clone()));
                        (refresh, true)
                    }
                },
            }
        };

        match refresh.await {
            Ok(token) => RefreshOutcome::Refreshed { token, leader },
            Err(err @ ClientError::SessionExpired { .. }) => RefreshOutcome::Failed {
                error: if leader {
                    err
                } else {
                    ClientError::TokenRefreshFailed { message: err.to_string() }
                },
                leader,
            },
            Err(err) if leader => RefreshOutcome::Failed {
                error: ClientError::SessionExpired { message: err.to_string() },
                leader,
            },
            Err(err) => RefreshOutcome::Failed {
                error: ClientError::TokenRefreshFailed { message: err.to_string() },
                leader,
            },
        }
    }

    fn start(&self, id: u64) -> SharedRefresh {
        let credentials = Arc::clone(&self.credentials);
        let refresher = Arc::clone(&self.refresher);
        let slot = Arc::clone(&self.in_flight);
        let refreshes = Arc::clone(&self.refreshes);

        let task = tokio::spawn(async move {
            refreshes.fetch_add(1, Ordering::Relaxed);
            let result = renew(credentials.as_ref(), refresher.as_ref()).await;
            if let Err(err) = &result {
                warn!(error = %err, "Token refresh failed, clearing credentials");
                credentials.remove_tokens().await;
            }

            let mut slot = slot.lock().await;
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|err| {
                Err(ClientError::TokenRefreshFailed {
                    message: format!("refresh task failed: {err}"),
                })
            })
        }
        .boxed()
        .shared()
    }

    /// Refreshes started so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

async fn renew(
    credentials: &dyn CredentialStore,
    refresher: &dyn TokenRefresher,
) -> Result<String, ClientError> {
    let Some(refresh_token) = credentials.get_refresh_token().await else {
        return Err(ClientError::SessionExpired { message: "no refresh token".to_string() });
    };
    let tier = credentials.active_tier().await;

    let pair = refresher.refresh(&refresh_token).await?;
    credentials.set_token(&pair.access_token, tier).await;
    if let Some(rotated) = &pair.refresh_token {
        credentials.set_refresh_token(rotated, tier).await;
    }
    info!(?tier, "Access token refreshed");
    Ok(pair.access_token)
}
