//! AutoConnection: runs each submitted task on its own pooled connection.
//!
//! A task is queued on `submit`, bound to a free connection by the
//! dispatcher, and driven inside an execution scope so the accessors
//! (`current_collection`, `current_commit`, ...) resolve to its connection.
//! When the work settles the pool commits (success) or rolls back
//! (failure or panic), delivers the result, returns the connection to the
//! free set and dispatches again.
//!
//! All bookkeeping lives behind one `std::sync::Mutex` that is never held
//! across an `.await`, so admission decisions are synchronous.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use memdb_core::{
    AutoConnectionConfig, BoxFuture, ClientError, ClientResult, CloseSignal, Collection,
    Connection, ConnectionFactory, ConnectionId,
};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::queue::TaskQueue;
use crate::registry::Registry;
use crate::scope::{self, ExecutionScope, PoolToken};

/// Delay before pending tasks retry after a failed connection open.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A queued task, type-erased. Called once with the pool and the connection
/// it was bound to.
type Job = Box<dyn FnOnce(AutoConnection, Binding) -> BoxFuture<'static, ()> + Send>;

struct Binding {
    id: ConnectionId,
    conn: Arc<dyn Connection>,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Registered connections (busy + free).
    pub connections: usize,
    /// Connections waiting for a task.
    pub free: usize,
    /// Connections bound to a running task.
    pub busy: usize,
    /// Connections whose `connect()` is in flight.
    pub opening: usize,
    /// Tasks queued for a connection.
    pub pending: usize,
    /// Tasks admitted since creation.
    pub submitted: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed_commits: u64,
    /// Submissions refused by admission control.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed_commits: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolState {
    registry: Registry,
    pending: TaskQueue<Job>,
}

struct Inner {
    config: AutoConnectionConfig,
    factory: Arc<dyn ConnectionFactory>,
    token: PoolToken,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool handle. Cheap to clone; clones share the same connections and queue.
///
/// Every method that dispatches work spawns onto the ambient Tokio runtime
/// and must be called from within one.
#[derive(Clone)]
pub struct AutoConnection {
    inner: Arc<Inner>,
}

impl AutoConnection {
    pub fn new(config: AutoConnectionConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        tracing::debug!(
            max_connections = config.max_connections,
            max_pending_tasks = config.max_pending_tasks,
            idle_timeout = ?config.connection_idle_timeout,
            host = %config.host,
            port = config.port,
            "auto connection created"
        );
        let state = PoolState {
            registry: Registry::new(config.max_connections),
            pending: TaskQueue::new(config.max_pending_tasks),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                token: PoolToken::default(),
                state: Mutex::new(state),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &AutoConnectionConfig {
        &self.inner.config
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Queue `work` to run on its own connection.
    ///
    /// Fails synchronously with [`ClientError::AdmissionRejected`] when
    /// `max_pending_tasks` tasks are already waiting. Otherwise returns a
    /// handle that settles after the transaction is committed or rolled
    /// back. Dropping the handle does not cancel the task.
    pub fn submit<F, Fut, T, E>(&self, work: F) -> ClientResult<TaskHandle<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<ClientError> + fmt::Display + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |pool: AutoConnection, binding: Binding| {
            Box::pin(pool.run_task(binding, work, tx)) as BoxFuture<'static, ()>
        });

        let admitted = self.inner.state().pending.push(job);
        if let Err(err) = admitted {
            Counters::bump(&self.inner.counters.rejected);
            tracing::warn!(error = %err, "task rejected");
            return Err(err);
        }
        Counters::bump(&self.inner.counters.submitted);
        self.dispatch();
        Ok(TaskHandle { rx })
    }

    /// Submit `work` and wait for its settled result. Admission rejection is
    /// returned through `E`.
    pub async fn transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<ClientError> + fmt::Display + Send + 'static,
    {
        self.submit(work).map_err(E::from)?.await
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Bind pending tasks to free connections, then open connections for
    /// the tasks still waiting, up to the cap.
    fn dispatch(&self) {
        let (ready, opens) = {
            let mut guard = self.inner.state();
            let state = &mut *guard;

            let mut ready = Vec::new();
            while !state.pending.is_empty() {
                let Some((id, conn)) = state.registry.take_free() else {
                    break;
                };
                match state.pending.pop() {
                    Some(job) => ready.push((job, Binding { id, conn })),
                    None => {
                        state.registry.release(id);
                        break;
                    }
                }
            }

            let mut opens = Vec::new();
            while state.pending.len() > state.registry.opening() {
                match state.registry.reserve() {
                    Some(id) => opens.push(id),
                    None => break,
                }
            }
            (ready, opens)
        };

        for (job, binding) in ready {
            tracing::debug!(connection = %binding.id, "task dispatched");
            binding.conn.set_bound(true);
            tokio::spawn(job(self.clone(), binding));
        }
        for id in opens {
            self.open_connection(id);
        }
    }

    async fn run_task<F, Fut, T, E>(
        self,
        binding: Binding,
        work: F,
        tx: oneshot::Sender<Result<T, E>>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<ClientError> + fmt::Display + Send + 'static,
    {
        let Binding { id, conn } = binding;
        let scope = ExecutionScope::new(self.inner.token.clone(), id);
        let started = Instant::now();

        // The work runs in its own task so a panic surfaces as a JoinError.
        let worked = match tokio::spawn(scope.clone().run(async move { work().await })).await {
            Ok(result) => result,
            Err(err) => Err(E::from(task_failure(err))),
        };
        let (result, reusable) = self.settle(&scope, Arc::clone(&conn), worked).await;

        tracing::info!(
            connection = %id,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task done"
        );
        if tx.send(result).is_err() {
            tracing::debug!(connection = %id, "task handle dropped before delivery");
        }
        if reusable {
            self.release(id, conn.as_ref());
        } else {
            self.retire(id);
        }
    }

    /// Commit on success, roll back on failure. The second value is `false`
    /// when the backend panicked during the wrap-up and the connection can
    /// no longer be trusted.
    async fn settle<T, E>(
        &self,
        scope: &ExecutionScope,
        conn: Arc<dyn Connection>,
        worked: Result<T, E>,
    ) -> (Result<T, E>, bool)
    where
        E: From<ClientError> + fmt::Display,
    {
        let id = scope.id;
        match worked {
            Ok(value) => match wrap_up(scope.clone(), conn, WrapUp::Commit).await {
                Ok(Ok(())) => {
                    Counters::bump(&self.inner.counters.committed);
                    (Ok(value), true)
                }
                Ok(Err(err)) => {
                    Counters::bump(&self.inner.counters.failed_commits);
                    tracing::warn!(connection = %id, error = %err, "commit failed");
                    let failed = ClientError::CommitFailed {
                        id,
                        reason: err.to_string(),
                    };
                    (Err(E::from(failed)), true)
                }
                Err(err) => {
                    Counters::bump(&self.inner.counters.failed_commits);
                    tracing::error!(connection = %id, error = %err, "commit panicked");
                    let failed = ClientError::CommitFailed {
                        id,
                        reason: err.to_string(),
                    };
                    (Err(E::from(failed)), false)
                }
            },
            Err(err) => {
                let reusable = match wrap_up(scope.clone(), conn, WrapUp::Rollback).await {
                    Ok(Ok(())) => true,
                    Ok(Err(rollback_err)) => {
                        tracing::warn!(connection = %id, error = %rollback_err, "rollback failed");
                        true
                    }
                    Err(panicked) => {
                        tracing::error!(connection = %id, error = %panicked, "rollback panicked");
                        false
                    }
                };
                Counters::bump(&self.inner.counters.rolled_back);
                tracing::warn!(connection = %id, error = %err, "task failed, rolled back");
                (Err(err), reusable)
            }
        }
    }

    fn release(&self, id: ConnectionId, conn: &dyn Connection) {
        // The close watcher may not have run yet.
        if conn.close_signal().is_closed() {
            self.deregister(id);
            return;
        }
        conn.set_bound(false);
        let freed = self.inner.state().registry.release(id);
        if !freed {
            tracing::debug!(connection = %id, "connection closed while busy, not reused");
        }
        self.dispatch();
    }

    /// Drop a connection whose state is unknown and close it in the
    /// background. Its slot opens up for pending tasks immediately.
    fn retire(&self, id: ConnectionId) {
        let retired = self.inner.state().registry.deregister(id);
        if let Some(conn) = retired {
            tracing::warn!(connection = %id, "connection retired");
            tokio::spawn(async move {
                if let Err(err) = conn.close().await {
                    tracing::warn!(
                        connection = %id,
                        error = %err,
                        "failed to close retired connection"
                    );
                }
            });
        }
        self.dispatch();
    }

    // ── Connection lifecycle ───────────────────────────────────────

    fn open_connection(&self, id: ConnectionId) {
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.connect(id).await {
                Ok(conn) => pool.register(id, conn),
                Err(err) => {
                    tracing::error!(connection = %id, error = %err, "failed to open connection");
                    pool.inner.state().registry.abandon_open();
                    pool.retry_later();
                }
            }
        });
    }

    async fn connect(&self, id: ConnectionId) -> ClientResult<Arc<dyn Connection>> {
        let opts = self.inner.config.connect_options();
        let conn = self.inner.factory.create(&opts)?;
        tracing::info!(
            connection = %id,
            host = %opts.host,
            port = opts.port,
            "opening connection"
        );
        conn.connect().await?;
        Ok(conn)
    }

    fn register(&self, id: ConnectionId, conn: Arc<dyn Connection>) {
        let signal = conn.close_signal();
        self.inner.state().registry.complete_open(id, conn);
        tracing::info!(connection = %id, "connection opened");
        self.watch_close(id, signal);
        self.dispatch();
    }

    fn watch_close(&self, id: ConnectionId, signal: CloseSignal) {
        let pool = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            signal.closed().await;
            if let Some(inner) = pool.upgrade() {
                AutoConnection { inner }.deregister(id);
            }
        });
    }

    fn deregister(&self, id: ConnectionId) {
        if self.inner.state().registry.deregister(id).is_some() {
            tracing::info!(connection = %id, "connection closed, removed from pool");
        }
        self.dispatch();
    }

    fn retry_later(&self) {
        let pool = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(OPEN_RETRY_DELAY).await;
            if let Some(inner) = pool.upgrade() {
                AutoConnection { inner }.dispatch();
            }
        });
    }

    // ── Scope accessors ────────────────────────────────────────────

    /// Connection bound to the calling task by this pool.
    pub fn current_connection(&self) -> ClientResult<Arc<dyn Connection>> {
        let id = scope::current_for(&self.inner.token)?;
        self.inner
            .state()
            .registry
            .get(id)
            .ok_or(ClientError::ConnectionClosed(id))
    }

    pub fn current_collection(&self, name: &str) -> ClientResult<Box<dyn Collection>> {
        Ok(self.current_connection()?.collection(name))
    }

    /// Commit the current task's writes so far. The task keeps its
    /// connection and the final commit or rollback still happens.
    pub async fn current_commit(&self) -> ClientResult<()> {
        let conn = self.current_connection()?;
        conn.commit().await
    }

    pub async fn current_rollback(&self) -> ClientResult<()> {
        let conn = self.current_connection()?;
        conn.rollback().await
    }

    pub async fn current_persist_all(&self) -> ClientResult<()> {
        let conn = self.current_connection()?;
        conn.persist_all().await
    }

    // ── Shutdown and statistics ────────────────────────────────────

    /// Close every registered connection, busy or free, and return how many
    /// closed cleanly. Tasks still running on a closed connection fail on
    /// their next operation or at commit.
    pub async fn shutdown(&self) -> usize {
        let connections = self.inner.state().registry.snapshot();
        tracing::info!(connections = connections.len(), "auto connection shutting down");

        let mut closing = JoinSet::new();
        for (id, conn) in connections {
            closing.spawn(async move { (id, conn.close().await) });
        }

        let mut closed = 0;
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    closed += 1;
                    tracing::debug!(connection = %id, "connection closed during shutdown");
                }
                Ok((id, Err(err))) => {
                    tracing::warn!(connection = %id, error = %err, "failed to close connection");
                }
                Err(err) => tracing::error!(error = %err, "close task failed"),
            }
        }

        tracing::info!(closed = closed, "auto connection shut down");
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let (connections, free, opening, pending) = {
            let state = self.inner.state();
            (
                state.registry.len(),
                state.registry.free_count(),
                state.registry.opening(),
                state.pending.len(),
            )
        };
        let counters = &self.inner.counters;
        PoolStats {
            connections,
            free,
            busy: connections.saturating_sub(free),
            opening,
            pending,
            submitted: counters.submitted.load(Ordering::Relaxed),
            committed: counters.committed.load(Ordering::Relaxed),
            rolled_back: counters.rolled_back.load(Ordering::Relaxed),
            failed_commits: counters.failed_commits.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            connections = stats.connections,
            free = stats.free,
            busy = stats.busy,
            opening = stats.opening,
            pending = stats.pending,
            submitted = stats.submitted,
            committed = stats.committed,
            rolled_back = stats.rolled_back,
            failed_commits = stats.failed_commits,
            rejected = stats.rejected,
            "pool statistics"
        );
    }
}

#[derive(Clone, Copy)]
enum WrapUp {
    Commit,
    Rollback,
}

/// Run the final commit or rollback in its own task, inside the task's
/// scope. The outer `Err` means the backend panicked or the step was
/// cancelled.
async fn wrap_up(
    scope: ExecutionScope,
    conn: Arc<dyn Connection>,
    step: WrapUp,
) -> Result<ClientResult<()>, ClientError> {
    let finishing = scope.run(async move {
        match step {
            WrapUp::Commit => conn.commit().await,
            WrapUp::Rollback => conn.rollback().await,
        }
    });
    tokio::spawn(finishing).await.map_err(task_failure)
}

fn task_failure(err: JoinError) -> ClientError {
    if !err.is_panic() {
        return ClientError::TaskAborted;
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    ClientError::TaskPanicked(message)
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl fmt::Debug for AutoConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoConnection")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Settles with the task's result once its transaction has been committed
/// or rolled back.
#[must_use = "dropping a TaskHandle discards the result but does not cancel the task"]
pub struct TaskHandle<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> Future for TaskHandle<T, E>
where
    E: From<ClientError>,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|delivered| {
            delivered.unwrap_or_else(|_| Err(E::from(ClientError::TaskAborted)))
        })
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}
