//! Request deduplication
//!
//! Concurrent identical reads share one in-flight operation. The first
//! caller for a key starts it; later callers await the same shared future.
//! The entry is removed exactly once, by the operation itself when it
//! completes, or by the last waiter when every caller has given up.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

struct InFlight<T: Clone> {
    id: u64,
    shared: Shared<BoxFuture<'static, T>>,
    waiters: usize,
    /// Cancels the underlying operation once nobody waits for it
    cancel: CancellationToken,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

/// Coalesces concurrent operations by key
pub struct DedupManager<T: Clone + Send + Sync + 'static> {
    in_flight: InFlightMap<T>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Default for DedupManager<T> {
    fn default() -> Self {
        Self { in_flight: Arc::new(Mutex::new(HashMap::new())), next_id: AtomicU64::new(0) }
    }
}

impl<T: Clone + Send + Sync + 'static> DedupManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start`'s operation under `key`, or join the one already running.
    ///
    /// `start` is only called when no operation is in flight for `key`; it
    /// returns the token that cancels the operation and the operation itself.
    /// Returns `None` if `cancelled` resolves before the result arrives. The
    /// operation keeps running for the remaining waiters.
    pub async fn coalesce<F, C>(&self, key: String, cancelled: C, start: F) -> Option<T>
    where
        F: FnOnce() -> (CancellationToken, BoxFuture<'static, T>),
        C: Future<Output = ()>,
    {
        let (shared, _guard) = {
            let mut map = self.in_flight.lock();
            let (id, shared) = match map.get_mut(&key) {
                Some(entry) => {
                    entry.waiters += 1;
                    debug!(key = %key, waiters = entry.waiters, "Joining in-flight request");
                    (entry.id, entry.shared.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (cancel, operation) = start();
                    let shared = self.wrap(key.clone(), id, operation);
                    map.insert(
                        key.clone(),
                        InFlight { id, shared: shared.clone(), waiters: 1, cancel },
                    );
                    (id, shared)
                }
            };
            (shared, WaiterGuard { in_flight: Arc::clone(&self.in_flight), key, id })
        };

        tokio::select! {
            biased;
            output = shared => Some(output),
            () = cancelled => None,
        }
    }

    /// Remove the entry once the operation resolves, unless a newer
    /// operation has already replaced it.
    fn wrap(
        &self,
        key: String,
        id: u64,
        operation: BoxFuture<'static, T>,
    ) -> Shared<BoxFuture<'static, T>> {
        let in_flight = Arc::clone(&self.in_flight);
        async move {
            let output = operation.await;
            let mut map = in_flight.lock();
            if map.get(&key).is_some_and(|entry| entry.id == id) {
                map.remove(&key);
            }
            output
        }
        .boxed()
        .shared()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Cancel and forget every in-flight operation
    pub fn clear(&self) {
        for (_, entry) in self.in_flight.lock().drain() {
            entry.cancel.cancel();
        }
    }
}

/// Tracks one waiter; the last one to leave cancels the operation.
struct WaiterGuard<T: Clone + Send + Sync + 'static> {
    in_flight: InFlightMap<T>,
    key: String,
    id: u64,
}

impl<T: Clone + Send + Sync + 'static> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock();
        let Some(entry) = map.get_mut(&self.key) else {
            return;
        };
        if entry.id != self.id {
            return;
        }
        entry.waiters -= 1;
        if entry.waiters == 0 {
            if let Some(entry) = map.remove(&self.key) {
                debug!(key = %self.key, "All waiters left, cancelling in-flight request");
                entry.cancel.cancel();
            }
        }
    }
}

/// Deterministic fingerprint of a request:
/// `METHOD:url:sorted-query-json:blake3(body)`.
pub fn request_key(
    method: &Method,
    url: &Url,
    query: &BTreeMap<String, String>,
    body: Option<&Value>,
) -> String {
    let params = serde_json::to_string(query).unwrap_or_default();
    let body_hash = match body {
        Some(body) => hex::encode(blake3::hash(body.to_string().as_bytes()).as_bytes()),
        None => String::new(),
    };
    format!("{method}:{url}:{params}:{body_hash}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn slow_op(
        counter: Arc<AtomicUsize>,
        value: u32,
    ) -> (CancellationToken, BoxFuture<'static, u32>) {
        let token = CancellationToken::new();
        let op = async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            value
        }
        .boxed();
        (token, op)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_operation() {
        let dedup = DedupManager::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let caller = CancellationToken::new();

        let (a, b) = tokio::join!(
            dedup.coalesce("k".into(), caller.cancelled(), || slow_op(calls.clone(), 1)),
            dedup.coalesce("k".into(), caller.cancelled(), || slow_op(calls.clone(), 2)),
        );

        assert_eq!(a, Some(1));
        assert_eq!(b, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_removed_after_completion() {
        let dedup = DedupManager::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let caller = CancellationToken::new();

        let first = dedup.coalesce("k".into(), caller.cancelled(), || slow_op(calls.clone(), 1));
        assert_eq!(first.await, Some(1));
        let second = dedup.coalesce("k".into(), caller.cancelled(), || slow_op(calls.clone(), 2));
        assert_eq!(second.await, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_cancel_follower() {
        let dedup = DedupManager::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let leader = CancellationToken::new();
        let follower = CancellationToken::new();
        let op_token = Arc::new(Mutex::new(None));

        let captured = Arc::clone(&op_token);
        let leader_call = dedup.coalesce("k".into(), leader.cancelled(), || {
            let (token, op) = slow_op(calls.clone(), 7);
            *captured.lock() = Some(token.clone());
            (token, op)
        });
        let follower_call =
            dedup.coalesce("k".into(), follower.cancelled(), || slow_op(calls.clone(), 8));
        let cancel_leader = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            leader.cancel();
        };

        let (a, b, ()) = tokio::join!(leader_call, follower_call, cancel_leader);
        assert_eq!(a, None);
        assert_eq!(b, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let token = op_token.lock().clone().unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_last_waiter_leaving_cancels_operation() {
        let dedup = DedupManager::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let caller = CancellationToken::new();
        caller.cancel();

        let op_token = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&op_token);
        let result = dedup
            .coalesce("k".into(), caller.cancelled(), || {
                let (token, op) = slow_op(calls.clone(), 1);
                *captured.lock() = Some(token.clone());
                (token, op)
            })
            .await;

        assert_eq!(result, None);
        assert_eq!(dedup.in_flight_count(), 0);
        assert!(op_token.lock().clone().unwrap().is_cancelled());
    }

    #[test]
    fn test_request_key_is_structural() {
        let url = Url::parse("http://api.test/users").unwrap();
        let mut query = BTreeMap::new();
        query.insert("page".to_string(), "1".to_string());

        let a = request_key(&Method::GET, &url, &query, Some(&json!({"b": 1, "a": 2})));
        let b = request_key(&Method::GET, &url, &query, Some(&json!({"a": 2, "b": 1})));
        let c = request_key(&Method::GET, &url, &BTreeMap::new(), None);
        let d = request_key(&Method::HEAD, &url, &BTreeMap::new(), None);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(c, d);
        assert!(c.starts_with("GET:http://api.test/users:"));
    }
}
