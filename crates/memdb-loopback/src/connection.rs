//! LoopbackConnection: a `Connection` over the shared `MemoryStore`.
//!
//! Writes are staged per connection (read-your-writes) and become visible
//! to other connections only on `commit`. Every operation yields to the
//! scheduler once, so callers observe real suspension points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memdb_core::document::{ID_FIELD, document_id};
use memdb_core::{
    BoxFuture, Change, ClientError, ClientResult, CloseNotifier, CloseSignal, Collection,
    ConnectOptions, Connection, UpdateOptions,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::factory::Faults;
use crate::store::{DocKey, MemoryStore, StagedWrites};

/// A loopback backend session.
#[derive(Clone)]
pub struct LoopbackConnection {
    shared: Arc<Shared>,
}

struct Shared {
    /// Factory-local creation number, for logs and test lookups.
    serial: u64,
    opts: ConnectOptions,
    store: Arc<MemoryStore>,
    faults: Arc<Faults>,
    staged: Mutex<StagedWrites>,
    connected: AtomicBool,
    /// Bound to a pool task; the idle clock is stopped.
    bound: AtomicBool,
    unbound: Notify,
    last_active: Mutex<Instant>,
    notifier: CloseNotifier,
}

impl Shared {
    fn staged(&self) -> MutexGuard<'_, StagedWrites> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.notifier.is_closed() || !self.connected.load(Ordering::Acquire) {
            return Err(ClientError::Backend(format!(
                "loopback connection #{} is not open",
                self.serial
            )));
        }
        self.touch();
        Ok(())
    }

    /// Committed view overlaid with this connection's staged writes.
    fn lookup(&self, key: &DocKey) -> Option<Value> {
        if let Some(staged) = self.staged().get(key) {
            return staged.clone();
        }
        self.store.get(&key.0, &key.1)
    }

    fn shut(&self, reason: &str) {
        self.connected.store(false, Ordering::Release);
        self.staged().clear();
        if self.notifier.notify() {
            info!(serial = self.serial, reason, "loopback connection closed");
        }
    }
}

impl LoopbackConnection {
    pub(crate) fn new(
        serial: u64,
        opts: ConnectOptions,
        store: Arc<MemoryStore>,
        faults: Arc<Faults>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                serial,
                opts,
                store,
                faults,
                staged: Mutex::new(StagedWrites::new()),
                connected: AtomicBool::new(false),
                bound: AtomicBool::new(false),
                unbound: Notify::new(),
                last_active: Mutex::new(Instant::now()),
                notifier: CloseNotifier::new(),
            }),
        }
    }

    pub fn serial(&self) -> u64 {
        self.shared.serial
    }

    pub fn is_open(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && !self.shared.notifier.is_closed()
    }

    /// Number of writes staged and not yet committed.
    pub fn staged_writes(&self) -> usize {
        self.shared.staged().len()
    }

    /// Simulate a backend-side failure: close without a client request.
    pub fn kill(&self) {
        self.shared.shut("killed");
    }

    fn spawn_idle_watchdog(&self) {
        let shared = Arc::clone(&self.shared);
        let idle = shared.opts.idle_timeout;
        let signal = shared.notifier.subscribe();

        tokio::spawn(async move {
            let closed = signal.closed();
            tokio::pin!(closed);
            loop {
                let deadline = shared.last_active() + idle;
                tokio::select! {
                    _ = &mut closed => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        if shared.bound.load(Ordering::Acquire) {
                            tokio::select! {
                                _ = &mut closed => break,
                                _ = shared.unbound.notified() => continue,
                            }
                        }
                        if shared.last_active().elapsed() >= idle {
                            shared.shut("idle timeout");
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("serial", &self.shared.serial)
            .field("host", &self.shared.opts.host)
            .field("port", &self.shared.opts.port)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Connection for LoopbackConnection {
    fn connect(&self) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            let delay = self.shared.faults.connect_delay();
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            if self.shared.faults.take_connect_failure() {
                return Err(ClientError::ConnectionOpenFailed(format!(
                    "connection refused by {}:{}",
                    self.shared.opts.host, self.shared.opts.port
                )));
            }
            if self.shared.notifier.is_closed() {
                return Err(ClientError::ConnectionOpenFailed(
                    "connection closed while connecting".to_string(),
                ));
            }
            self.shared.connected.store(true, Ordering::Release);
            self.shared.touch();
            self.shared.faults.record_connected();
            self.spawn_idle_watchdog();
            debug!(serial = self.shared.serial, "loopback connection established");
            Ok(())
        })
    }

    fn commit(&self) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            let staged = std::mem::take(&mut *self.shared.staged());
            if self.shared.faults.commits_fail() {
                return Err(ClientError::Backend("injected commit failure".to_string()));
            }
            self.shared.store.apply(staged);
            Ok(())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            self.shared.staged().clear();
            self.shared.store.record_rollback();
            if self.shared.faults.rollbacks_fail() {
                return Err(ClientError::Backend("injected rollback failure".to_string()));
            }
            Ok(())
        })
    }

    fn persist_all(&self) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            self.shared.store.persist();
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.shared.shut("closed by client");
            Ok(())
        })
    }

    fn collection(&self, name: &str) -> Box<dyn Collection> {
        Box::new(LoopbackCollection {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
        })
    }

    fn close_signal(&self) -> CloseSignal {
        self.shared.notifier.subscribe()
    }

    fn set_bound(&self, bound: bool) {
        self.shared.bound.store(bound, Ordering::Release);
        if !bound {
            // Idle time counts from the moment the connection is freed.
            self.shared.touch();
            self.shared.unbound.notify_one();
        }
    }
}

struct LoopbackCollection {
    shared: Arc<Shared>,
    name: String,
}

impl LoopbackCollection {
    fn key(&self, id: &str) -> DocKey {
        (self.name.clone(), id.to_string())
    }
}

impl Collection for LoopbackCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, doc: Value) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            let key = self.key(&document_id(&doc)?);
            if self.shared.lookup(&key).is_some() {
                return Err(ClientError::Document(format!(
                    "duplicate {ID_FIELD} {} in {}",
                    key.1, self.name
                )));
            }
            self.shared.staged().insert(key, Some(doc));
            Ok(())
        })
    }

    fn find<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ClientResult<Option<Value>>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            Ok(self.shared.lookup(&self.key(id)))
        })
    }

    fn update<'a>(
        &'a self,
        id: &'a str,
        change: Change,
        opts: UpdateOptions,
    ) -> BoxFuture<'a, ClientResult<bool>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            let key = self.key(id);
            let mut doc = match self.shared.lookup(&key) {
                Some(doc) => doc,
                None if opts.upsert => json!({ ID_FIELD: id }),
                None => return Ok(false),
            };
            change.apply(&mut doc)?;
            self.shared.staged().insert(key, Some(doc));
            Ok(true)
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ClientResult<bool>> {
        Box::pin(async move {
            self.shared.ensure_open()?;
            tokio::task::yield_now().await;
            let key = self.key(id);
            let existed = self.shared.lookup(&key).is_some();
            if existed {
                self.shared.staged().insert(key, None);
            }
            Ok(existed)
        })
    }
}
