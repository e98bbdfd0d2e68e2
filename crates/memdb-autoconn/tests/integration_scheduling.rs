//! Pool scheduling against the loopback backend: admission control, the
//! connection cap, exclusive binding, FIFO dispatch and connection
//! lifecycle (open failures, idle close, close while busy, shutdown), and
//! recovery from backends that panic or close under the scheduler.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memdb_autoconn::{AutoConnection, current_connection_id};
use memdb_core::{
    AutoConnectionConfig, BoxFuture, ClientError, ClientResult, CloseSignal, Collection,
    ConnectOptions, Connection, ConnectionFactory, ConnectionId,
};
use memdb_loopback::{LoopbackFactory, MemoryStore};
use tokio::sync::Barrier;

mod common;
use common::init_tracing;

struct Harness {
    pool: AutoConnection,
    factory: Arc<LoopbackFactory>,
}

fn harness(config: AutoConnectionConfig) -> Harness {
    harness_with(config, LoopbackFactory::new(Arc::new(MemoryStore::new())))
}

fn harness_with(config: AutoConnectionConfig, factory: LoopbackFactory) -> Harness {
    init_tracing();
    let factory = Arc::new(factory);
    Harness {
        pool: AutoConnection::new(config, factory.clone()),
        factory,
    }
}

async fn noop() -> Result<(), ClientError> {
    Ok(())
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

// ── Admission control ───────────────────────────────────────────────

#[tokio::test]
async fn full_queue_rejects_synchronously() {
    let h = harness_with(
        AutoConnectionConfig::default()
            .with_max_connections(1)
            .with_max_pending_tasks(2),
        LoopbackFactory::new(Arc::new(MemoryStore::new()))
            .with_connect_delay(Duration::from_millis(50)),
    );

    let first = h.pool.submit(noop).unwrap();
    let second = h.pool.submit(noop).unwrap();
    let err = h.pool.submit(noop).unwrap_err();
    assert_eq!(err, ClientError::AdmissionRejected { pending: 2, limit: 2 });

    let stats = h.pool.stats();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.submitted, 2);

    first.await.unwrap();
    second.await.unwrap();

    // Queue drained, admission open again.
    h.pool.submit(noop).unwrap().await.unwrap();
    assert_eq!(h.pool.stats().committed, 3);
}

#[tokio::test]
async fn zero_pending_limit_rejects_everything() {
    let h = harness(AutoConnectionConfig::default().with_max_pending_tasks(0));

    let err = h.pool.submit(noop).unwrap_err();
    assert!(err.is_admission_rejected());

    tokio::task::yield_now().await;
    assert_eq!(h.factory.created(), 0, "no connection opened for a rejected task");
    assert_eq!(h.pool.stats().connections, 0);
}

// ── Binding ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_connection_runs_two_tasks_at_once() {
    let h = harness(AutoConnectionConfig::default().with_max_connections(4));
    let in_use: Arc<Mutex<HashSet<ConnectionId>>> = Arc::default();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let in_use = in_use.clone();
        let handle = h
            .pool
            .submit(move || async move {
                let id = current_connection_id().ok_or(ClientError::NoActiveScope)?;
                assert!(in_use.lock().unwrap().insert(id), "{id} bound twice");
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_use.lock().unwrap().remove(&id);
                Ok::<_, ClientError>(id)
            })
            .unwrap();
        handles.push(handle);
    }

    let mut seen = HashSet::new();
    for handle in handles {
        seen.insert(handle.await.unwrap());
    }
    assert!(seen.len() <= 4);
    assert!(h.factory.created() <= 4);
    assert_eq!(h.pool.stats().committed, 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_count_never_exceeds_cap() {
    let h = harness_with(
        AutoConnectionConfig::default().with_max_connections(3),
        LoopbackFactory::new(Arc::new(MemoryStore::new()))
            .with_connect_delay(Duration::from_millis(5)),
    );
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let pool = h.pool.clone();
        let peak = peak.clone();
        let handle = h
            .pool
            .submit(move || async move {
                let stats = pool.stats();
                peak.fetch_max(stats.connections + stats.opening, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
                Ok::<_, ClientError>(())
            })
            .unwrap();
        handles.push(handle);

        let stats = h.pool.stats();
        assert!(stats.connections + stats.opening <= 3, "{stats:?}");
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(h.factory.created() <= 3);
    assert!(h.pool.stats().connections <= 3);
}

#[tokio::test]
async fn single_connection_dispatches_in_fifo_order() {
    let h = harness(AutoConnectionConfig::default().with_max_connections(1));
    let order: Arc<Mutex<Vec<usize>>> = Arc::default();

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let order = order.clone();
            h.pool
                .submit(move || async move {
                    order.lock().unwrap().push(i);
                    tokio::task::yield_now().await;
                    Ok::<_, ClientError>(())
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn sequential_tasks_reuse_one_connection() {
    let h = harness(AutoConnectionConfig::default());
    for _ in 0..5 {
        h.pool.transaction(noop).await.unwrap();
    }
    assert_eq!(h.factory.created(), 1);

    let stats = h.pool.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.busy, 0);
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_open_is_retried_for_pending_tasks() {
    let h = harness(AutoConnectionConfig::default());
    h.factory.fail_next_connects(1);

    let value = h
        .pool
        .transaction(|| async { Ok::<_, ClientError>(5) })
        .await
        .unwrap();
    assert_eq!(value, 5);

    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.factory.connected(), 1);
    let stats = h.pool.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.opening, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_leave_the_pool() {
    let h = harness(
        AutoConnectionConfig::default().with_idle_timeout(Duration::from_millis(100)),
    );

    h.pool.transaction(noop).await.unwrap();
    assert_eq!(h.pool.stats().connections, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.pool.stats().connections, 0);
    assert_eq!(h.pool.stats().free, 0);

    h.pool.transaction(noop).await.unwrap();
    assert_eq!(h.factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn busy_connection_outlives_idle_timeout() {
    let h = harness(
        AutoConnectionConfig::default().with_idle_timeout(Duration::from_millis(100)),
    );

    let value = h
        .pool
        .transaction(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ClientError>(1)
        })
        .await;

    assert_eq!(value, Ok(1));
    assert_eq!(h.pool.stats().committed, 1);
    assert_eq!(h.pool.stats().free, 1);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn connection_closed_while_busy_is_not_reused() {
    let h = harness(AutoConnectionConfig::default());
    let pool = h.pool.clone();
    let factory = h.factory.clone();

    let result = h
        .pool
        .transaction(move || async move {
            let id = current_connection_id().ok_or(ClientError::NoActiveScope)?;
            for conn in factory.connections() {
                conn.kill();
            }
            // Wait for the pool to observe the close.
            loop {
                match pool.current_connection() {
                    Err(ClientError::ConnectionClosed(closed)) => {
                        assert_eq!(closed, id);
                        break;
                    }
                    Ok(_) => tokio::task::yield_now().await,
                    Err(other) => return Err(other),
                }
            }
            Ok::<_, ClientError>(())
        })
        .await;

    assert!(
        matches!(result, Err(ClientError::CommitFailed { .. })),
        "{result:?}"
    );
    let stats = h.pool.stats();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.free, 0);

    // The next task gets a fresh connection.
    h.pool.transaction(noop).await.unwrap();
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.pool.stats().connections, 1);
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let h = harness(AutoConnectionConfig::default().with_max_connections(3));
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let barrier = barrier.clone();
            h.pool
                .submit(move || async move {
                    barrier.wait().await;
                    Ok::<_, ClientError>(())
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(h.pool.stats().connections, 3);
    h.pool.log_stats();

    assert_eq!(h.pool.shutdown().await, 3);
    assert!(h.factory.live_connections().is_empty());

    let pool = h.pool.clone();
    eventually("connections to deregister", move || {
        pool.stats().connections == 0
    })
    .await;
}

#[tokio::test]
async fn dropped_handle_still_commits() {
    let h = harness(AutoConnectionConfig::default());
    let handle = h.pool.submit(noop).unwrap();
    drop(handle);

    let store = h.factory.store().clone();
    eventually("the commit", move || store.commits() == 1).await;
    let pool = h.pool.clone();
    eventually("the connection to be freed", move || pool.stats().free == 1).await;
}

// ── Scheduler recovery ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct PanicSwitch {
    commit: AtomicBool,
    rollback: AtomicBool,
}

/// Loopback connection whose commit or rollback panics on demand.
#[derive(Debug)]
struct PanickingConnection {
    inner: Arc<dyn Connection>,
    switch: Arc<PanicSwitch>,
}

impl Connection for PanickingConnection {
    fn connect(&self) -> BoxFuture<'_, ClientResult<()>> {
        self.inner.connect()
    }

    fn commit(&self) -> BoxFuture<'_, ClientResult<()>> {
        if self.switch.commit.load(Ordering::SeqCst) {
            panic!("commit exploded");
        }
        self.inner.commit()
    }

    fn rollback(&self) -> BoxFuture<'_, ClientResult<()>> {
        if self.switch.rollback.load(Ordering::SeqCst) {
            panic!("rollback exploded");
        }
        self.inner.rollback()
    }

    fn persist_all(&self) -> BoxFuture<'_, ClientResult<()>> {
        self.inner.persist_all()
    }

    fn close(&self) -> BoxFuture<'_, ClientResult<()>> {
        self.inner.close()
    }

    fn collection(&self, name: &str) -> Box<dyn Collection> {
        self.inner.collection(name)
    }

    fn close_signal(&self) -> CloseSignal {
        self.inner.close_signal()
    }

    fn set_bound(&self, bound: bool) {
        self.inner.set_bound(bound)
    }
}

struct PanickingFactory {
    loopback: LoopbackFactory,
    switch: Arc<PanicSwitch>,
}

impl ConnectionFactory for PanickingFactory {
    fn create(&self, opts: &ConnectOptions) -> ClientResult<Arc<dyn Connection>> {
        Ok(Arc::new(PanickingConnection {
            inner: self.loopback.create(opts)?,
            switch: self.switch.clone(),
        }))
    }
}

fn panicking_pool() -> (AutoConnection, Arc<PanickingFactory>) {
    init_tracing();
    let factory = Arc::new(PanickingFactory {
        loopback: LoopbackFactory::new(Arc::new(MemoryStore::new())),
        switch: Arc::default(),
    });
    let pool = AutoConnection::new(
        AutoConnectionConfig::default().with_max_connections(1),
        factory.clone(),
    );
    (pool, factory)
}

#[tokio::test]
async fn panicking_commit_retires_the_connection() {
    let (pool, factory) = panicking_pool();
    factory.switch.commit.store(true, Ordering::SeqCst);

    match pool.transaction(noop).await {
        Err(ClientError::CommitFailed { id, reason }) => {
            assert_eq!(id, ConnectionId::new(1));
            assert!(reason.contains("commit exploded"), "{reason}");
        }
        other => panic!("expected commit failure, got {other:?}"),
    }
    let stats = pool.stats();
    assert_eq!(stats.connections, 0, "{stats:?}");
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.failed_commits, 1);

    factory.switch.commit.store(false, Ordering::SeqCst);
    let next = tokio::time::timeout(
        Duration::from_secs(5),
        pool.transaction(|| async { Ok::<_, ClientError>(2) }),
    )
    .await
    .expect("pool keeps dispatching");
    assert_eq!(next, Ok(2));
    assert_eq!(factory.loopback.created(), 2);
    assert_eq!(pool.stats().free, 1);
}

#[tokio::test]
async fn panicking_rollback_still_delivers_task_error() {
    let (pool, factory) = panicking_pool();
    factory.switch.rollback.store(true, Ordering::SeqCst);

    let result: Result<(), ClientError> = pool
        .transaction(|| async { Err(ClientError::Document("bad quest".into())) })
        .await;
    assert_eq!(result, Err(ClientError::Document("bad quest".into())));
    assert_eq!(pool.stats().rolled_back, 1);
    assert_eq!(pool.stats().connections, 0);

    factory.switch.rollback.store(false, Ordering::SeqCst);
    let next = tokio::time::timeout(Duration::from_secs(5), pool.transaction(noop))
        .await
        .expect("pool keeps dispatching");
    assert_eq!(next, Ok(()));
    assert_eq!(factory.loopback.created(), 2);
}

#[tokio::test]
async fn free_connection_closing_under_queued_tasks() {
    let h = harness(AutoConnectionConfig::default().with_max_connections(1));
    h.pool.transaction(noop).await.unwrap();
    assert_eq!(h.pool.stats().free, 1);

    // No yield between the close and the submissions: the pool has not
    // seen the close event yet and binds the first task to the dead
    // connection.
    h.factory.connections()[0].kill();
    let handles: Vec<_> = (0..3).map(|_| h.pool.submit(noop).unwrap()).collect();
    assert_eq!(h.pool.stats().pending, 2);

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await);
    }
    assert!(
        matches!(results[0], Err(ClientError::CommitFailed { .. })),
        "{:?}",
        results[0]
    );
    assert!(results[1..].iter().all(Result::is_ok), "{results:?}");

    assert_eq!(h.factory.created(), 2);
    let stats = h.pool.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.pending, 0);
}
