//! memdb-bench: throughput workloads for the MemDB auto-connection pool.
//!
//! Runs against the in-process loopback backend, so the numbers measure
//! pool scheduling and transaction demarcation overhead.
//!
//! # Usage
//!
//! ```text
//! memdb-bench single-doc --count 10000
//! memdb-bench --config memdb.toml concurrent --count 1000 --rate 300
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use memdb_autoconn::AutoConnection;
use memdb_core::{AutoConnectionConfig, ClientConfigFile};
use memdb_loopback::{LoopbackFactory, MemoryStore};

mod workloads;

#[derive(Parser)]
#[command(
    name = "memdb-bench",
    about = "MemDB auto-connection benchmarks",
    version
)]
struct Cli {
    /// Config file with a `[client]` section (default: built-in limits).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sequential transactions, one increment of the same document each.
    SingleDoc {
        #[arg(long, default_value = "10000")]
        count: u64,
    },
    /// Increments of one document inside a single transaction.
    OneTransaction {
        #[arg(long, default_value = "100000")]
        count: u64,
    },
    /// Upserts of many distinct documents inside a single transaction.
    HugeDocs {
        #[arg(long, default_value = "10000")]
        count: u64,
    },
    /// Single-increment transactions started on a fixed schedule.
    Concurrent {
        #[arg(long, default_value = "1000")]
        count: u64,

        /// Requests started per second.
        #[arg(long, default_value = "300")]
        rate: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,memdb_autoconn=warn"))?,
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ClientConfigFile::from_file(path)?.into_config(),
        None => AutoConnectionConfig::default(),
    };
    let factory = Arc::new(LoopbackFactory::new(Arc::new(MemoryStore::new())));
    let pool = AutoConnection::new(config, factory);

    let outcome = match cli.command {
        Command::SingleDoc { count } => workloads::single_doc(&pool, count).await,
        Command::OneTransaction { count } => workloads::one_transaction(&pool, count).await,
        Command::HugeDocs { count } => workloads::huge_docs(&pool, count).await,
        Command::Concurrent { count, rate } => workloads::concurrent(&pool, count, rate).await,
    };

    pool.log_stats();
    pool.shutdown().await;
    outcome
}
