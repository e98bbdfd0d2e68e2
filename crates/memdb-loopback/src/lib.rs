//! memdb-loopback: in-process MemDB backend.
//!
//! Implements the `memdb-core` connection seam over a shared in-memory
//! document store. Each connection stages its writes and publishes them on
//! commit. Idle connections close themselves after the configured timeout.
//!
//! Used by the client test suites and the `memdb-bench` binary; it has no
//! locking, sharding or replication.

pub mod connection;
pub mod factory;
pub mod store;

pub use connection::LoopbackConnection;
pub use factory::LoopbackFactory;
pub use store::MemoryStore;
