//! LoopbackFactory: builds loopback connections and injects faults.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use memdb_core::{ClientResult, ConnectOptions, Connection, ConnectionFactory};

use crate::connection::LoopbackConnection;
use crate::store::MemoryStore;

/// Fault switches shared between a factory and its connections.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    fail_connects: AtomicUsize,
    fail_commits: AtomicBool,
    fail_rollbacks: AtomicBool,
    connect_delay_ms: AtomicU64,
    connected: AtomicU64,
}

impl Faults {
    /// Consume one pending connect failure, if any.
    pub(crate) fn take_connect_failure(&self) -> bool {
        self.fail_connects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn commits_fail(&self) -> bool {
        self.fail_commits.load(Ordering::Acquire)
    }

    pub(crate) fn rollbacks_fail(&self) -> bool {
        self.fail_rollbacks.load(Ordering::Acquire)
    }

    pub(crate) fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }
}

/// `ConnectionFactory` over one shared `MemoryStore`.
pub struct LoopbackFactory {
    store: Arc<MemoryStore>,
    faults: Arc<Faults>,
    created: Mutex<Vec<LoopbackConnection>>,
}

impl LoopbackFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            faults: Arc::new(Faults::default()),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Delay every `connect()` by `delay` (tokio time).
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.faults
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Make the next `n` connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.faults.fail_connects.store(n, Ordering::Release);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.faults.fail_commits.store(fail, Ordering::Release);
    }

    pub fn fail_rollbacks(&self, fail: bool) {
        self.faults.fail_rollbacks.store(fail, Ordering::Release);
    }

    /// Connections constructed so far, including failed ones.
    pub fn created(&self) -> usize {
        self.connections().len()
    }

    /// Connections whose `connect()` succeeded.
    pub fn connected(&self) -> u64 {
        self.faults.connected.load(Ordering::Relaxed)
    }

    /// Every connection this factory built, in creation order.
    pub fn connections(&self) -> Vec<LoopbackConnection> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> Vec<LoopbackConnection> {
        self.connections()
            .into_iter()
            .filter(LoopbackConnection::is_open)
            .collect()
    }
}

impl ConnectionFactory for LoopbackFactory {
    fn create(&self, opts: &ConnectOptions) -> ClientResult<Arc<dyn Connection>> {
        let mut created = self
            .created
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let conn = LoopbackConnection::new(
            created.len() as u64 + 1,
            opts.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.faults),
        );
        created.push(conn.clone());
        Ok(Arc::new(conn))
    }
}

impl std::fmt::Debug for LoopbackFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackFactory")
            .field("created", &self.created())
            .field("connected", &self.connected())
            .finish_non_exhaustive()
    }
}
