//! Node registry - the in-memory table of connected worker sessions.
//!
//! All mutations go through the registry's internal lock; connection
//! handlers never share ad hoc state. A session's outbound sink is a
//! single-writer resource guarded by its own async mutex, since both
//! the dispatcher's replies and the job forwarder's relays send to the
//! same connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{FrameError, JsonLinesCodec};
use crate::bridge::protocol::CoordMessage;

/// Boxed so sessions work over TCP halves in production and in-memory
/// duplex streams in tests.
pub type MessageSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonLinesCodec<CoordMessage>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Registered,
    Disconnected,
}

/// One connected worker.
pub struct NodeSession {
    name: String,
    host: String,
    port: u16,
    /// Monotonic registration order, used for the first-registered
    /// fallback and to guard against a stale handler removing a
    /// replacement session with the same name.
    seq: u64,
    state: StdMutex<SessionState>,
    models: StdMutex<BTreeSet<String>>,
    sink: tokio::sync::Mutex<MessageSink>,
}

impl NodeSession {
    fn new(
        name: String,
        host: String,
        port: u16,
        seq: u64,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            name,
            host,
            port,
            seq,
            state: StdMutex::new(SessionState::Registered),
            models: StdMutex::new(BTreeSet::new()),
            sink: tokio::sync::Mutex::new(FramedWrite::new(writer, JsonLinesCodec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> SessionState {
        *lock_or_recover(&self.state)
    }

    pub fn mark_disconnected(&self) {
        *lock_or_recover(&self.state) = SessionState::Disconnected;
    }

    pub fn models(&self) -> Vec<String> {
        lock_or_recover(&self.models).iter().cloned().collect()
    }

    pub fn set_models(&self, models: Vec<String>) {
        *lock_or_recover(&self.models) = models.into_iter().collect();
    }

    pub fn add_model(&self, model: impl Into<String>) {
        lock_or_recover(&self.models).insert(model.into());
    }

    /// Send one message on this session's connection. Writers are
    /// serialized so concurrent producers cannot interleave frames.
    pub async fn send(&self, message: CoordMessage) -> Result<(), FrameError> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await
    }
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("seq", &self.seq)
            .field("state", &self.state())
            .finish()
    }
}

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("session mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, Arc<NodeSession>>,
    /// Inventories that arrived before their CONNECT finished
    /// registering; applied when the session appears.
    early_models: HashMap<String, Vec<String>>,
}

/// In-memory table of live worker sessions. Not persisted.
pub struct NodeRegistry {
    inner: StdMutex<RegistryInner>,
    next_seq: AtomicU64,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(RegistryInner {
                sessions: HashMap::new(),
                early_models: HashMap::new(),
            }),
            next_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("registry mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a session for `name`, replacing any live session with
    /// the same name. The evicted session (if any) is marked
    /// disconnected and returned so the caller can log the takeover;
    /// `find` always resolves to the latest registration.
    pub fn register(
        &self,
        name: &str,
        host: impl Into<String>,
        port: u16,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> (Arc<NodeSession>, Option<Arc<NodeSession>>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(NodeSession::new(
            name.to_string(),
            host.into(),
            port,
            seq,
            writer,
        ));

        let mut inner = self.lock();
        if let Some(models) = inner.early_models.remove(name) {
            session.set_models(models);
        }
        let replaced = inner.sessions.insert(name.to_string(), Arc::clone(&session));
        drop(inner);

        if let Some(ref old) = replaced {
            old.mark_disconnected();
            tracing::warn!(node = name, old_seq = old.seq(), new_seq = seq, "replacing live session with duplicate name");
        } else {
            tracing::info!(node = name, seq, "registered worker session");
        }

        (session, replaced)
    }

    /// Remove a session by name, whichever registration currently owns it.
    pub fn unregister(&self, name: &str) -> Option<Arc<NodeSession>> {
        let removed = self.lock().sessions.remove(name);
        if let Some(ref session) = removed {
            session.mark_disconnected();
            tracing::info!(node = name, "unregistered worker session");
        }
        removed
    }

    /// Remove a specific session. A handler whose session was replaced
    /// by a newer registration must not tear down the replacement, so
    /// removal only happens when the stored entry is this exact one.
    pub fn remove_session(&self, session: &Arc<NodeSession>) -> bool {
        let mut inner = self.lock();
        let matches = inner
            .sessions
            .get(session.name())
            .is_some_and(|current| current.seq() == session.seq());
        if matches {
            inner.sessions.remove(session.name());
        }
        drop(inner);

        session.mark_disconnected();
        if matches {
            tracing::info!(node = session.name(), "unregistered worker session");
        }
        matches
    }

    pub fn find(&self, name: &str) -> Option<Arc<NodeSession>> {
        self.lock().sessions.get(name).cloned()
    }

    /// First-registered fallback when no target is named. A coarse
    /// placement choice, not a scheduler.
    pub fn default_session(&self) -> Option<Arc<NodeSession>> {
        self.lock()
            .sessions
            .values()
            .min_by_key(|s| s.seq())
            .cloned()
    }

    /// Replace a worker's advertised inventory. Tolerates an update
    /// arriving before the CONNECT for that name has finished
    /// registering: the inventory is stashed and applied on register.
    pub fn update_models(&self, name: &str, models: Vec<String>) {
        let mut inner = self.lock();
        match inner.sessions.get(name) {
            Some(session) => session.set_models(models),
            None => {
                tracing::debug!(node = name, "inventory update before registration, stashing");
                inner.early_models.insert(name.to_string(), models);
            }
        }
    }

    /// Append one model to a worker's inventory (used when a training
    /// completion reports a new artifact).
    pub fn add_model(&self, name: &str, model: &str) {
        if let Some(session) = self.lock().sessions.get(name) {
            session.add_model(model);
        }
    }

    pub fn list_all(&self) -> Vec<(String, Vec<String>)> {
        let mut sessions: Vec<Arc<NodeSession>> =
            self.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.seq());
        sessions
            .into_iter()
            .map(|s| (s.name().to_string(), s.models()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_writer() -> Box<dyn AsyncWrite + Send + Unpin> {
        let (_rx, tx) = tokio::io::duplex(1024);
        Box::new(tx)
    }

    #[tokio::test]
    async fn register_find_unregister() {
        let registry = NodeRegistry::new();
        let (session, replaced) = registry.register("w1", "127.0.0.1", 9000, test_writer());

        assert!(replaced.is_none());
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("w1").unwrap().seq(), session.seq());

        let removed = registry.unregister("w1").unwrap();
        assert_eq!(removed.state(), SessionState::Disconnected);
        assert!(registry.is_empty());
        assert!(registry.find("w1").is_none());
    }

    #[tokio::test]
    async fn duplicate_name_replaces_old_session() {
        let registry = NodeRegistry::new();
        let (old, _) = registry.register("w1", "127.0.0.1", 9000, test_writer());
        let (new, replaced) = registry.register("w1", "127.0.0.1", 9001, test_writer());

        assert_eq!(replaced.unwrap().seq(), old.seq());
        assert_eq!(old.state(), SessionState::Disconnected);
        assert_eq!(registry.len(), 1);
        // The latest registration is the one `find` resolves to.
        assert_eq!(registry.find("w1").unwrap().seq(), new.seq());
    }

    #[tokio::test]
    async fn stale_handler_cannot_remove_replacement() {
        let registry = NodeRegistry::new();
        let (old, _) = registry.register("w1", "127.0.0.1", 9000, test_writer());
        let (new, _) = registry.register("w1", "127.0.0.1", 9001, test_writer());

        // The old connection's handler winds down after replacement.
        assert!(!registry.remove_session(&old));
        assert_eq!(registry.find("w1").unwrap().seq(), new.seq());

        assert!(registry.remove_session(&new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn inventory_update_before_registration_is_applied_later() {
        let registry = NodeRegistry::new();
        registry.update_models("w1", vec!["cats".to_string()]);
        assert!(registry.find("w1").is_none());

        let (session, _) = registry.register("w1", "127.0.0.1", 9000, test_writer());
        assert_eq!(session.models(), vec!["cats".to_string()]);
    }

    #[tokio::test]
    async fn list_all_reports_registration_order() {
        let registry = NodeRegistry::new();
        registry.register("w2", "127.0.0.1", 9001, test_writer());
        registry.register("w1", "127.0.0.1", 9000, test_writer());
        registry.update_models("w1", vec!["cats".to_string()]);

        let all = registry.list_all();
        assert_eq!(
            all,
            vec![
                ("w2".to_string(), vec![]),
                ("w1".to_string(), vec!["cats".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn default_session_is_first_registered() {
        let registry = NodeRegistry::new();
        assert!(registry.default_session().is_none());

        let (first, _) = registry.register("w1", "127.0.0.1", 9000, test_writer());
        registry.register("w2", "127.0.0.1", 9001, test_writer());

        assert_eq!(registry.default_session().unwrap().seq(), first.seq());

        registry.unregister("w1");
        assert_eq!(registry.default_session().unwrap().name(), "w2");
    }

    #[tokio::test]
    async fn add_model_appends_to_inventory() {
        let registry = NodeRegistry::new();
        let (session, _) = registry.register("w1", "127.0.0.1", 9000, test_writer());
        session.set_models(vec!["dogs".to_string()]);

        registry.add_model("w1", "cats");
        assert_eq!(
            session.models(),
            vec!["cats".to_string(), "dogs".to_string()]
        );

        // Unknown node is a no-op.
        registry.add_model("w9", "cats");
    }
}
