//! Connection registry: live connections, the free set, and the cap.
//!
//! Pure bookkeeping with no I/O. The pool owns one `Registry` behind its
//! state lock; every method runs between suspension points.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use memdb_core::{Connection, ConnectionId};

pub(crate) struct Registry {
    max_connections: usize,
    connections: HashMap<ConnectionId, Arc<dyn Connection>>,
    /// Registered ids not bound to any task. Always a subset of `connections`.
    free: BTreeSet<ConnectionId>,
    /// Ids reserved for connections whose `connect()` is still in flight.
    opening: usize,
    next_id: u64,
}

impl Registry {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connections: HashMap::new(),
            free: BTreeSet::new(),
            opening: 0,
            next_id: 0,
        }
    }

    /// Reserve a fresh id for a new connection, unless live plus opening
    /// connections already reach the cap.
    pub(crate) fn reserve(&mut self) -> Option<ConnectionId> {
        if self.connections.len() + self.opening >= self.max_connections {
            return None;
        }
        self.next_id += 1;
        self.opening += 1;
        Some(ConnectionId::new(self.next_id))
    }

    /// Register a connected handle under its reserved id and mark it free.
    pub(crate) fn complete_open(&mut self, id: ConnectionId, conn: Arc<dyn Connection>) {
        self.opening = self.opening.saturating_sub(1);
        self.connections.insert(id, conn);
        self.free.insert(id);
    }

    /// Give back a reservation whose connect failed. The id is never used.
    pub(crate) fn abandon_open(&mut self) {
        self.opening = self.opening.saturating_sub(1);
    }

    /// Take the lowest free id out of the free set.
    pub(crate) fn take_free(&mut self) -> Option<(ConnectionId, Arc<dyn Connection>)> {
        while let Some(id) = self.free.pop_first() {
            match self.connections.get(&id) {
                Some(conn) => return Some((id, Arc::clone(conn))),
                None => tracing::error!(connection = %id, "free id missing from registry, dropped"),
            }
        }
        None
    }

    /// Return a bound id to the free set. Returns `false` if the connection
    /// was deregistered while busy.
    pub(crate) fn release(&mut self, id: ConnectionId) -> bool {
        if self.connections.contains_key(&id) {
            self.free.insert(id);
            true
        } else {
            false
        }
    }

    /// Forget a connection, whatever state it is in.
    pub(crate) fn deregister(&mut self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.free.remove(&id);
        self.connections.remove(&id)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.connections.get(&id).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<(ConnectionId, Arc<dyn Connection>)> {
        self.connections
            .iter()
            .map(|(id, conn)| (*id, Arc::clone(conn)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn opening(&self) -> usize {
        self.opening
    }
}
