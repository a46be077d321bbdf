//! Storage Connection Pool
//!
//! SQLite access for scripts with a two-tier discipline:
//!
//! - **Writes** for a path go through exactly one writer thread, fed by a
//!   bounded queue, so statements for that path apply in enqueue order.
//! - **Reads** run on the calling thread under the path's shared lock; the
//!   writer holds the same lock exclusively while a statement runs.
//!
//! The path to lock map is an explicit [`LockRegistry`] handed to
//! [`StoragePool::new`], so tests can build isolated pools.

mod locks;
mod pool;

pub use locks::LockRegistry;
pub use pool::{
    PendingWrite, Row, StorageConnection, StorageError, StoragePool, BUSY_TIMEOUT,
    WRITE_QUEUE_CAPACITY,
};
