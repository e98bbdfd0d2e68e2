//! memdb-core: shared vocabulary for the MemDB client.
//!
//! - **config**: pool limits, backend address, `memdb.toml` parsing
//! - **error**: `ClientError` taxonomy
//! - **connection**: the backend seam (`Connection`, `Collection`,
//!   `ConnectionFactory`) and the one-shot close event
//! - **document**: document ids and update changes

pub mod config;
pub mod connection;
pub mod document;
pub mod error;

pub use config::{AutoConnectionConfig, ClientConfigFile, ConnectOptions};
pub use connection::{
    BoxFuture, CloseNotifier, CloseSignal, Collection, Connection, ConnectionFactory,
    ConnectionId,
};
pub use document::{Change, UpdateOptions, document_id};
pub use error::{ClientError, ClientResult};
