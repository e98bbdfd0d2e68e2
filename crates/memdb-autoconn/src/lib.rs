//! memdb-autoconn: the MemDB auto-connection pool.
//!
//! `AutoConnection` runs each submitted unit of work on a dedicated pooled
//! connection and treats it as one transaction: commit when the work
//! succeeds, rollback when it fails or panics. Inside the work, the pool's
//! accessors resolve to that task's connection through a task-local
//! execution scope.
//!
//! ```ignore
//! let pool = AutoConnection::new(AutoConnectionConfig::default(), factory);
//! let p = pool.clone();
//! pool.transaction(move || async move {
//!     p.current_collection("player")?
//!         .update("1", Change::inc("exp", 1), UpdateOptions::upsert())
//!         .await?;
//!     Ok::<_, ClientError>(())
//! })
//! .await?;
//! ```

pub mod pool;
pub mod scope;

mod queue;
mod registry;

pub use pool::{AutoConnection, OPEN_RETRY_DELAY, PoolStats, TaskHandle};
pub use scope::{current_connection_id, spawn_in_scope};
