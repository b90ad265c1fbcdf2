//! Client connections and the registry that tracks them.
//!
//! A connection owns its published `AuthState`, the operations held behind
//! an in-progress bind, the set of outstanding message ids, and the channel
//! results travel back to the protocol layer on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use ldapd_core::{AuthState, ConnectionId, LdapResult, MessageId, Operation};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::sasl::BindStateMachine;

/// A bind negotiation in progress on one connection.
#[derive(Debug)]
pub(crate) struct BindSession {
    pub mechanism: String,
    /// `None` while a worker is running a step.
    pub machine: Option<BindStateMachine>,
    /// Set once a challenge has been sent; the next bind with the same
    /// mechanism is then the continuation.
    pub awaiting_continuation: bool,
    /// Identity before the bind started, restored on failure.
    pub previous: Arc<AuthState>,
}

/// Mutable per-connection state.
///
/// Lock order: a connection's state lock is always taken before the work
/// queue lock, never the other way round.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub bind: Option<BindSession>,
    pub held: VecDeque<Arc<Operation>>,
    pub outstanding: HashMap<MessageId, Arc<Operation>>,
    pub closed: bool,
}

/// One client session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_address: String,
    connected_at: Instant,
    auth: ArcSwap<AuthState>,
    pub(crate) state: Mutex<ConnectionState>,
    results: mpsc::UnboundedSender<LdapResult>,
}

impl Connection {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current authentication snapshot.
    #[must_use]
    pub fn auth(&self) -> Arc<AuthState> {
        self.auth.load_full()
    }

    pub(crate) fn publish_auth(&self, auth: AuthState) {
        self.auth.store(Arc::new(auth));
    }

    /// Operations waiting behind an in-progress bind.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Operations admitted or held and not yet completed.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Hands a result to the protocol layer. Returns `false` if the
    /// receiving side has gone away; the result is then discarded.
    pub(crate) fn deliver(&self, result: LdapResult) -> bool {
        self.results.send(result).is_ok()
    }
}

/// Thread-safe registry of open connections.
///
/// Uses `DashMap` so lookups from many submitting threads do not contend.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Connection ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new anonymous connection and returns it with the
    /// receiver its results arrive on.
    pub fn register(
        &self,
        peer_address: impl Into<String>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<LdapResult>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            id,
            peer_address: peer_address.into(),
            connected_at: Instant::now(),
            auth: ArcSwap::from_pointee(AuthState::anonymous()),
            state: Mutex::new(ConnectionState::default()),
            results: tx,
        });
        self.connections.insert(id, Arc::clone(&connection));
        (connection, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of every registered connection.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ldapd_core::ResultCode;

    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register("10.0.0.1:1000");
        let (b, _rx_b) = registry.register("10.0.0.2:1000");
        assert_eq!(a.id(), ConnectionId(1));
        assert_eq!(b.id(), ConnectionId(2));
        assert_eq!(registry.count(), 2);
        assert_eq!(a.peer_address(), "10.0.0.1:1000");
    }

    #[test]
    fn new_connections_are_anonymous() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registry.register("peer");
        assert!(conn.auth().is_anonymous());
        assert_eq!(conn.held_count(), 0);
        assert!(!conn.is_closed());
    }

    #[test]
    fn remove_and_get() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registry.register("peer");
        assert!(registry.get(conn.id()).is_some());
        assert!(registry.remove(conn.id()).is_some());
        assert!(registry.get(conn.id()).is_none());
        assert!(registry.remove(conn.id()).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn deliver_reaches_receiver_until_dropped() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = registry.register("peer");
        assert!(conn.deliver(LdapResult::success(MessageId(1))));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.code, ResultCode::Success);

        drop(rx);
        assert!(!conn.deliver(LdapResult::success(MessageId(2))));
    }
}
