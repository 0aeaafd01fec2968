//! Correlation bridge between foreground callers and asynchronous
//! worker replies.
//!
//! A caller creates an entry keyed by the request's correlation key and
//! then awaits it with a deadline; the dispatcher fulfills the entry
//! when the matching reply arrives on some worker connection. Waiting
//! is a genuine blocking wait on a oneshot channel, not a poll loop.
//!
//! Entries are fulfilled at most once. Timed-out and abandoned entries
//! are evicted so a late reply is dropped instead of leaking into an
//! unrelated later request reusing the same key space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for a correlated reply")]
    TimedOut,

    /// The entry was replaced or the bridge dropped the sender before a
    /// reply arrived; the caller observes the same contract as a timeout.
    #[error("request was superseded before a reply arrived")]
    Superseded,
}

struct Slot {
    tx: oneshot::Sender<serde_json::Value>,
    ticket: u64,
}

/// Shared table of in-flight correlated requests.
pub struct PendingRequests {
    slots: StdMutex<HashMap<String, Slot>>,
    next_ticket: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: StdMutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("pending-request mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Create an entry for `key` and return the ticket the caller
    /// awaits. Created immediately before the triggering message is
    /// sent; if the send fails, dropping the ticket evicts the entry.
    pub fn create(self: &Arc<Self>, key: impl Into<String>, timeout: Duration) -> PendingTicket {
        let key = key.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if let Some(_prev) = self.lock().insert(key.clone(), Slot { tx, ticket }) {
            // Keys are built from request context precisely so this
            // cannot happen between unrelated requests.
            tracing::warn!(key = %key, "replacing pending request with duplicate key");
        }

        PendingTicket {
            key,
            ticket,
            deadline: Instant::now() + timeout,
            rx: Some(rx),
            bridge: Arc::clone(self),
        }
    }

    /// Fulfill the entry for `key`, if one is still waiting.
    ///
    /// At-most-once: the first fulfillment consumes the entry, and any
    /// further fulfillment for the same key is a logged no-op.
    pub fn fulfill(&self, key: &str, payload: serde_json::Value) {
        let slot = self.lock().remove(key);
        match slot {
            Some(slot) => {
                if slot.tx.send(payload).is_err() {
                    tracing::debug!(key, "waiter gone before fulfillment was delivered");
                }
            }
            None => {
                tracing::warn!(key, "fulfillment for unknown or already-fulfilled key, dropping");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the entry only if it still belongs to `ticket` - a newer
    /// request with the same key must not be evicted by a stale waiter.
    fn evict(&self, key: &str, ticket: u64) -> bool {
        let mut slots = self.lock();
        if slots.get(key).is_some_and(|slot| slot.ticket == ticket) {
            slots.remove(key);
            true
        } else {
            false
        }
    }
}

/// A caller's handle to one pending request.
pub struct PendingTicket {
    key: String,
    ticket: u64,
    deadline: Instant,
    rx: Option<oneshot::Receiver<serde_json::Value>>,
    bridge: Arc<PendingRequests>,
}

impl PendingTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until the entry is fulfilled or the deadline passes.
    /// Expiry evicts the entry so a late reply is dropped.
    pub async fn wait(mut self) -> Result<serde_json::Value, WaitError> {
        let Some(rx) = self.rx.take() else {
            return Err(WaitError::Superseded);
        };

        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                self.bridge.evict(&self.key, self.ticket);
                Err(WaitError::Superseded)
            }
            Err(_) => {
                if self.bridge.evict(&self.key, self.ticket) {
                    tracing::debug!(key = %self.key, "pending request timed out, entry evicted");
                }
                Err(WaitError::TimedOut)
            }
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        // A ticket abandoned without being awaited (e.g. the forward
        // failed) must not leave a dangling entry behind.
        if self.rx.is_some() {
            self.bridge.evict(&self.key, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(5);
    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn fulfilled_entry_resolves_the_waiter() {
        let bridge = PendingRequests::new();
        let ticket = bridge.create("train_1", LONG);

        bridge.fulfill("train_1", json!({"model": "cats"}));

        let payload = ticket.wait().await.unwrap();
        assert_eq!(payload, json!({"model": "cats"}));
        assert!(bridge.is_empty());
    }

    #[tokio::test]
    async fn second_fulfillment_is_a_no_op() {
        let bridge = PendingRequests::new();
        let ticket = bridge.create("train_1", LONG);

        bridge.fulfill("train_1", json!("first"));
        bridge.fulfill("train_1", json!("second"));

        assert_eq!(ticket.wait().await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn wait_times_out_and_evicts() {
        let bridge = PendingRequests::new();
        let ticket = bridge.create("train_1", SHORT);

        assert_eq!(ticket.wait().await.unwrap_err(), WaitError::TimedOut);
        assert!(bridge.is_empty());

        // A late reply after expiry is dropped, not delivered anywhere.
        bridge.fulfill("train_1", json!("late"));
        assert!(bridge.is_empty());
    }

    #[tokio::test]
    async fn unrelated_keys_resolve_independently() {
        let bridge = PendingRequests::new();
        let a = bridge.create("w1:a", LONG);
        let b = bridge.create("w1:b", LONG);

        // Replies arrive in the opposite order of the requests.
        bridge.fulfill("w1:b", json!("b"));
        bridge.fulfill("w1:a", json!("a"));

        assert_eq!(a.wait().await.unwrap(), json!("a"));
        assert_eq!(b.wait().await.unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn fulfillment_on_one_key_does_not_release_another() {
        let bridge = PendingRequests::new();
        let ticket = bridge.create("train_1", SHORT);
        bridge.create("train_2", LONG); // dropped immediately, evicted

        bridge.fulfill("train_9", json!("stray"));
        assert_eq!(ticket.wait().await.unwrap_err(), WaitError::TimedOut);
    }

    #[tokio::test]
    async fn dropped_ticket_leaves_no_dangling_entry() {
        let bridge = PendingRequests::new();
        let ticket = bridge.create("train_1", LONG);
        assert_eq!(bridge.len(), 1);

        drop(ticket);
        assert!(bridge.is_empty());
    }

    #[tokio::test]
    async fn duplicate_key_supersedes_the_old_waiter() {
        let bridge = PendingRequests::new();
        let old = bridge.create("train_1", LONG);
        let new = bridge.create("train_1", LONG);

        assert_eq!(old.wait().await.unwrap_err(), WaitError::Superseded);

        bridge.fulfill("train_1", json!("for-the-new-one"));
        assert_eq!(new.wait().await.unwrap(), json!("for-the-new-one"));
    }
}
