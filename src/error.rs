//! Error taxonomy for the storage engine (`spec.md` §7).
//!
//! Lock acquisition outcomes are modeled as [`LockResult`], a sum type rather
//! than an exception, so callers can match on contention without paying for
//! a heap-allocated error on the common path. Everything else surfaces as
//! [`DbError`].

use thiserror::Error;

/// Outcome of a lock acquisition attempt (`spec.md` §4.5, §9 Design Notes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// The lock was not held at all before this call and is still not held.
    Unowned,
    /// The requester already owned the lock in (at least) the requested mode.
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
    /// The lock was newly acquired in the requested mode.
    Acquired,
    /// An upgradable hold was promoted to exclusive.
    Upgraded,
    /// The wait was interrupted.
    Interrupted,
    /// A cycle was found in the wait-for graph; this requester is the one
    /// chosen to fail so the others can proceed (`spec.md` §4.5, §7).
    Deadlock(DeadlockInfo),
    /// The wait exceeded the requester's timeout.
    TimedOut,
    /// The request is illegal given the requester's current hold (e.g.
    /// promoting from shared while another upgrader already owns the lock).
    Illegal,
}

impl LockResult {
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
                | LockResult::Acquired
                | LockResult::Upgraded
        )
    }
}

/// A deadlock cycle discovered by the lock manager's wait-for graph walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// (index id, key) pairs found on the cycle, in walk order.
    pub locks: Vec<(u64, Vec<u8>)>,
}

/// The engine's error taxonomy, grouped by kind per `spec.md` §7.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    // --- Argument errors: not recoverable at this level ---
    #[error("invalid page id {0}")]
    InvalidPageId(u64),
    #[error("illegal page size {0}: must be a power of two >= 512")]
    IllegalPageSize(usize),
    #[error("null or empty key where one is not permitted")]
    NullKey,
    #[error("no index registered with id {0}")]
    UnknownIndex(u64),
    #[error("an index with that name already exists")]
    DuplicateIndexName,

    // --- Lock failures: recoverable, transaction may retry or exit scope ---
    #[error("lock wait timed out")]
    TimedOutLock,
    #[error("deadlock detected: {0:?}")]
    Deadlock(DeadlockInfo),
    #[error("illegal lock upgrade requested")]
    IllegalUpgrade,
    #[error("lock wait was interrupted")]
    Interrupted,

    // --- Transaction failures ---
    #[error("transaction is invalid (borked) and must be reset")]
    InvalidTransaction,
    #[error("replica lost leadership mid-write")]
    UnmodifiableReplica,

    // --- Capacity failures: recoverable ---
    #[error("key of {len} bytes exceeds the in-memory maximum of {max} bytes")]
    LargeKey { len: usize, max: usize },
    #[error("value of {len} bytes exceeds the maximum representable length")]
    LargeValue { len: u64 },
    #[error("unique constraint violated for key")]
    UniqueConstraint,

    // --- I/O failures: propagate, may panic the database ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch reading page {page} at generation {generation}")]
    ChecksumMismatch { page: u64, generation: u64 },

    // --- Corruption: unrecoverable ---
    #[error("database corruption detected: {0}")]
    Corrupt(&'static str),

    // --- Lifecycle ---
    #[error("database is closed")]
    Closed,
    #[error("database has panicked and must be reopened: {0}")]
    Panicked(&'static str),
}

impl DbError {
    /// Whether this failure happened before any mutation was recorded, i.e.
    /// a pre-state failure that need not bork the enclosing transaction
    /// (`spec.md` §7 propagation policy).
    pub fn is_pre_state(&self) -> bool {
        matches!(
            self,
            DbError::InvalidPageId(_)
                | DbError::IllegalPageSize(_)
                | DbError::NullKey
                | DbError::UnknownIndex(_)
                | DbError::DuplicateIndexName
                | DbError::TimedOutLock
                | DbError::Interrupted
                | DbError::IllegalUpgrade
        )
    }
}

pub type DbResult<T> = Result<T, DbError>;

impl From<LockResult> for DbError {
    fn from(r: LockResult) -> Self {
        match r {
            LockResult::TimedOut => DbError::TimedOutLock,
            LockResult::Interrupted => DbError::Interrupted,
            LockResult::Deadlock(info) => DbError::Deadlock(info),
            LockResult::Illegal => DbError::IllegalUpgrade,
            _ => DbError::Corrupt("LockResult converted to DbError in a non-failure state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_variants_report_owned() {
        assert!(LockResult::OwnedShared.is_owned());
        assert!(LockResult::Acquired.is_owned());
        assert!(!LockResult::TimedOut.is_owned());
        assert!(!LockResult::Unowned.is_owned());
    }

    #[test]
    fn pre_state_errors_do_not_bork() {
        assert!(DbError::TimedOutLock.is_pre_state());
        assert!(!DbError::ChecksumMismatch { page: 0, generation: 0 }.is_pre_state());
    }
}
