//! Scripted transport for tests
//!
//! [`MockTransport`] answers from a closure (or a fixed sequence) and records
//! every request it receives, so tests can assert on exactly what reached the
//! wire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::transport::{RawResponse, Transport, TransportError, TransportRequest};

type Handler = dyn Fn(&TransportRequest) -> Result<RawResponse, TransportError> + Send + Sync;

/// Test double for [`Transport`]
pub struct MockTransport {
    handler: Arc<Handler>,
    delay: Option<Duration>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl MockTransport {
    /// Answer every request with `handler`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&TransportRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    {
        Self { handler: Arc::new(handler), delay: None, requests: Mutex::new(Vec::new()) }
    }

    /// Answer requests in order; once exhausted every request fails as a
    /// network error.
    pub fn sequence(responses: Vec<Result<RawResponse, TransportError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network("no scripted response left")))
        })
    }

    /// Wait `delay` before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests whose URL path equals `path`
    pub fn count_path(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|request| request.url.path() == path).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<RawResponse, TransportError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }
}
