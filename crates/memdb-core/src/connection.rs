//! Backend connection seam.
//!
//! The pool never talks to the wire directly. It drives connections only
//! through [`Connection`] (`connect` / `commit` / `rollback` / `close`) and
//! listens for the one-shot close event exposed by [`CloseSignal`].
//! Concrete backends are injected through a [`ConnectionFactory`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::config::ConnectOptions;
use crate::document::{Change, UpdateOptions};
use crate::error::ClientResult;

/// Boxed, sendable future returned by the backend traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Registry-assigned connection identifier. Monotonic, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One backend session.
///
/// Every method returning a future is a suspension point. `close_signal`
/// may be subscribed at any time, including after the connection closed.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Establish the session.
    fn connect(&self) -> BoxFuture<'_, ClientResult<()>>;
    /// Commit all changes staged on this connection.
    fn commit(&self) -> BoxFuture<'_, ClientResult<()>>;
    /// Discard all changes staged on this connection.
    fn rollback(&self) -> BoxFuture<'_, ClientResult<()>>;
    /// Ask the backend to flush committed state to persistent storage.
    fn persist_all(&self) -> BoxFuture<'_, ClientResult<()>>;
    /// Close the session. Fires the close event.
    fn close(&self) -> BoxFuture<'_, ClientResult<()>>;
    /// Handle to a named collection on this connection.
    fn collection(&self, name: &str) -> Box<dyn Collection>;
    /// Subscribe to the close event (idle timeout, backend error, `close()`).
    fn close_signal(&self) -> CloseSignal;
    /// Called by the pool when the connection is bound to a task (`true`)
    /// and when it goes back to the free set (`false`). Backends with an
    /// idle timeout must not expire a bound connection.
    fn set_bound(&self, _bound: bool) {}
}

/// Document operations scoped to one collection of one connection.
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;
    /// Insert a document; it must carry an `_id`.
    fn insert(&self, doc: Value) -> BoxFuture<'_, ClientResult<()>>;
    fn find<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ClientResult<Option<Value>>>;
    /// Apply `change` to the document. Returns whether a document was written.
    fn update<'a>(
        &'a self,
        id: &'a str,
        change: Change,
        opts: UpdateOptions,
    ) -> BoxFuture<'a, ClientResult<bool>>;
    /// Remove a document. Returns whether it existed.
    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ClientResult<bool>>;
}

/// Builds new connections for the pool.
///
/// The factory owns whatever data-store handle its connections attach to.
/// Construction is synchronous; `Connection::connect` does the I/O.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, opts: &ConnectOptions) -> ClientResult<Arc<dyn Connection>>;
}

/// Sending half of a connection's close event. Idempotent.
#[derive(Clone, Debug)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the connection closed. Returns `true` only on the first call.
    pub fn notify(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a connection's close event.
#[derive(Clone, Debug)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once the connection has closed, immediately if it already
    /// has. A dropped notifier counts as closed.
    pub async fn closed(mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}
