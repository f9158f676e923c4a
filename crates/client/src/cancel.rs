//! Request cancellation
//!
//! Every pending request holds a child of the current generation token,
//! which is itself a child of the registry's root. `cancel_all` cancels the
//! generation and starts a fresh one; `shutdown` cancels the root for good.
//! A request registered under a key already in use cancels the older one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Pending {
    generation: CancellationToken,
    keyed: HashMap<String, (u64, CancellationToken)>,
    unkeyed: HashMap<u64, CancellationToken>,
}

#[derive(Debug)]
pub struct CancelRegistry {
    root: CancellationToken,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
}

impl Default for CancelRegistry {
    fn default() -> Self {
        let root = CancellationToken::new();
        let pending = Pending {
            generation: root.child_token(),
            keyed: HashMap::new(),
            unkeyed: HashMap::new(),
        };
        Self { root, pending: Arc::new(Mutex::new(pending)), next_id: AtomicU64::new(0) }
    }
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a new pending request, optionally under `key`.
    ///
    /// A keyed registration cancels whatever was pending under the same key.
    /// The entry is removed when the returned registration is dropped.
    pub fn register(&self, key: Option<&str>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        let token = pending.generation.child_token();
        let slot = match key {
            Some(key) => {
                if let Some((_, previous)) =
                    pending.keyed.insert(key.to_string(), (id, token.clone()))
                {
                    debug!(key, "Cancelling superseded request");
                    previous.cancel();
                }
                Slot::Keyed(key.to_string())
            }
            None => {
                pending.unkeyed.insert(id, token.clone());
                Slot::Unkeyed
            }
        };
        Registration { pending: Arc::clone(&self.pending), slot, id, token }
    }

    /// Untracked child of the current generation, for work shared by
    /// several registered requests
    pub fn child_token(&self) -> CancellationToken {
        self.pending.lock().generation.child_token()
    }

    /// Cancel the request pending under `key`
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.lock().keyed.remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending request, keyed or not; returns how many there
    /// were. Requests registered afterwards run normally.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.keyed.len() + pending.unkeyed.len();
        pending.keyed.clear();
        pending.unkeyed.clear();
        let previous = std::mem::replace(&mut pending.generation, self.root.child_token());
        previous.cancel();
        debug!(count, "Cancelled all pending requests");
        count
    }

    /// Cancel everything for good
    pub fn shutdown(&self) {
        self.root.cancel();
        self.cancel_all();
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock();
        pending.keyed.len() + pending.unkeyed.len()
    }
}

#[derive(Debug)]
enum Slot {
    Keyed(String),
    Unkeyed,
}

/// A pending request
#[derive(Debug)]
pub struct Registration {
    pending: Arc<Mutex<Pending>>,
    slot: Slot,
    id: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        match &self.slot {
            Slot::Keyed(key) => {
                if pending.keyed.get(key).is_some_and(|(id, _)| *id == self.id) {
                    pending.keyed.remove(key);
                }
            }
            Slot::Unkeyed => {
                pending.unkeyed.remove(&self.id);
            }
        }
    }
}
