//! Execution scope: the ambient binding from a running task to its
//! connection.
//!
//! Every dispatched task runs inside a `tokio::task_local!` scope that
//! carries the bound connection id and a token naming the owning pool.
//! Task-locals do not cross `tokio::spawn`; work that fans out and needs
//! the binding must use [`spawn_in_scope`].

use std::future::Future;
use std::sync::Arc;

use memdb_core::{ClientError, ClientResult, ConnectionId};
use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT: ExecutionScope;
}

/// Identity of one pool. Compared by pointer, held alive by every scope
/// that carries it.
#[derive(Clone, Debug, Default)]
pub(crate) struct PoolToken(Arc<()>);

impl PoolToken {
    pub(crate) fn same(&self, other: &PoolToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ExecutionScope {
    pub(crate) pool: PoolToken,
    pub(crate) id: ConnectionId,
}

impl ExecutionScope {
    pub(crate) fn new(pool: PoolToken, id: ConnectionId) -> Self {
        Self { pool, id }
    }

    /// Drive `fut` with this scope installed.
    pub(crate) async fn run<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}

/// Connection id bound to the current task, for whichever pool dispatched it.
pub fn current_connection_id() -> Option<ConnectionId> {
    CURRENT.try_with(|scope| scope.id).ok()
}

/// Connection id bound by `pool`. Scopes installed by other pools are
/// invisible here.
pub(crate) fn current_for(pool: &PoolToken) -> ClientResult<ConnectionId> {
    CURRENT
        .try_with(|scope| scope.pool.same(pool).then_some(scope.id))
        .ok()
        .flatten()
        .ok_or(ClientError::NoActiveScope)
}

/// `tokio::spawn` that carries the caller's execution scope into the new
/// task. Outside any scope it behaves exactly like `tokio::spawn`.
///
/// The spawned task shares the caller's connection; it must finish before
/// the caller's work returns, or its writes race the commit.
pub fn spawn_in_scope<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match CURRENT.try_with(Clone::clone) {
        Ok(scope) => tokio::spawn(CURRENT.scope(scope, fut)),
        Err(_) => tokio::spawn(fut),
    }
}
