//! An embedded, single-process, ordered key/value storage engine with ACID
//! transactions, crash recovery, and non-blocking snapshots.
//!
//! [`Database`] is the entry point: open one against a file (durable) or
//! with no backing file (an ephemeral, still-ACID scratch database), start
//! [`Transaction`]s against it, and read/write through the default index or
//! any index created with [`Database::create_index`].

pub mod alloc;
pub mod cache;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod error;
pub mod latch;
pub mod listener;
pub mod lock;
pub mod page_array;
pub mod recovery;
pub mod redo;
pub mod replication;
pub mod scheduler;
pub mod snapshot;
pub mod tree;
pub mod txn;
pub mod undo;

pub use config::DatabaseConfig;
pub use database::{Database, DEFAULT_INDEX_ID};
pub use error::{DbError, DbResult, DeadlockInfo, LockResult};
pub use listener::{CheckpointPhase, EventListener, NullListener, RecoveryPhase};
pub use snapshot::Snapshot;
pub use txn::{DurabilityMode, LockMode, Transaction};
