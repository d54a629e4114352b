//! Transactions (C9, `spec.md` §4.9).
//!
//! A `Transaction` bundles an undo log, a lock-mode default, a durability
//! mode, and a stack of nested scopes (savepoints). It does not itself know
//! how to apply undo records or acquire locks — those are supplied by the
//! database handle that owns it — so this module stays a plain state
//! machine, mirroring how the teacher keeps `ReadTxn`/`WriteTxn` as thin
//! value types around an `IdTracker`.

use crate::undo::UndoLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No redo log entry is written at all; on crash, committed data since
    /// the last checkpoint is lost.
    NoRedo,
    /// A redo entry is written but never flushed to the OS.
    NoFlush,
    /// Flushed to the OS but `fsync` is not waited on.
    NoSync,
    /// Flushed and fsynced before commit returns.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// No locking at all; callers are responsible for external
    /// serialization.
    Unsafe,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    /// Reads take an upgradable lock so they can be promoted to exclusive
    /// without releasing and reacquiring (the default, per `spec.md` §6).
    UpgradableRead,
}

const HAS_SCOPE: u8 = 1 << 0;
const HAS_COMMIT: u8 = 1 << 1;
const HAS_TRASH: u8 = 1 << 2;
const HAS_PREPARE: u8 = 1 << 3;

/// A single nested scope (`Transaction::enter`), recording where in the
/// undo log the scope began so `exit` can roll back just this scope.
struct Scope {
    undo_mark_present: bool,
}

/// An ACID transaction handle (`spec.md` §4.9).
pub struct Transaction {
    id: u64,
    durability_mode: DurabilityMode,
    lock_mode: LockMode,
    lock_timeout_nanos: i64,
    undo: UndoLog,
    scopes: Vec<Scope>,
    flags: u8,
    attachment: Option<Box<dyn std::any::Any + Send>>,
    borked: Option<&'static str>,
}

impl Transaction {
    pub fn new(id: u64, durability_mode: DurabilityMode, lock_mode: LockMode, lock_timeout_nanos: i64) -> Self {
        Self {
            id,
            durability_mode,
            lock_mode,
            lock_timeout_nanos,
            undo: UndoLog::new(id),
            scopes: Vec::new(),
            flags: 0,
            attachment: None,
            borked: None,
        }
    }

    /// A singleton standing in for "no transaction" (auto-commit
    /// operations), matching the teacher's use of a sentinel rather than
    /// `Option<&Transaction>` at every call site.
    pub fn bogus() -> Self {
        Self::new(0, DurabilityMode::Sync, LockMode::UpgradableRead, 0)
    }

    pub fn is_bogus(&self) -> bool {
        self.id == 0
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }

    pub fn set_durability_mode(&mut self, mode: DurabilityMode) {
        self.durability_mode = mode;
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    pub fn lock_timeout_nanos(&self) -> i64 {
        self.lock_timeout_nanos
    }

    pub fn set_lock_timeout_nanos(&mut self, nanos: i64) {
        self.lock_timeout_nanos = nanos;
    }

    pub fn undo_mut(&mut self) -> &mut UndoLog {
        &mut self.undo
    }

    pub fn undo(&self) -> &UndoLog {
        &self.undo
    }

    pub fn attach(&mut self, value: Box<dyn std::any::Any + Send>) {
        self.attachment = Some(value);
    }

    pub fn attachment(&self) -> Option<&(dyn std::any::Any + Send)> {
        self.attachment.as_deref()
    }

    pub fn is_borked(&self) -> Option<&'static str> {
        self.borked
    }

    pub fn bork(&mut self, reason: &'static str) {
        self.borked = Some(reason);
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn has_scope(&self) -> bool {
        self.has_flag(HAS_SCOPE)
    }

    pub fn has_trash(&self) -> bool {
        self.has_flag(HAS_TRASH)
    }

    pub fn mark_has_trash(&mut self) {
        self.set_flag(HAS_TRASH);
    }

    pub fn is_prepared(&self) -> bool {
        self.has_flag(HAS_PREPARE)
    }

    /// Open a new nested scope (savepoint). Per `spec.md` §4.9, `exit`
    /// rolls back only the scope's own changes; `commit` while scopes remain
    /// open merges the innermost scope into its parent rather than making
    /// anything durable.
    pub fn enter(&mut self) {
        self.undo.push_scope_mark();
        self.scopes.push(Scope {
            undo_mark_present: true,
        });
        self.set_flag(HAS_SCOPE);
    }

    /// Roll back to the most recently entered scope, discarding it.
    /// Returns the undo records that were rolled back, most-recent-first,
    /// so the caller can replay them against the tree.
    pub fn exit(&mut self) -> Vec<crate::undo::UndoRecord> {
        let popped = self.undo.pop_to_scope();
        self.scopes.pop();
        if self.scopes.is_empty() {
            self.clear_flag(HAS_SCOPE);
        }
        popped
    }

    /// Commit: if scopes remain open, only the innermost scope is promoted
    /// (its records stay on the stack but its `ScopeMark` is dropped,
    /// merging it into the parent scope); once the outermost scope commits,
    /// the whole undo log is discarded and this becomes a durable commit.
    /// Returns `true` if this was the outermost (durable) commit.
    pub fn commit(&mut self) -> bool {
        if let Some(_scope) = self.scopes.pop() {
            if self.scopes.is_empty() {
                self.clear_flag(HAS_SCOPE);
                self.undo.discard_on_commit();
                self.set_flag(HAS_COMMIT);
                true
            } else {
                false
            }
        } else {
            self.undo.discard_on_commit();
            self.set_flag(HAS_COMMIT);
            true
        }
    }

    /// Roll back everything, regardless of scope nesting.
    pub fn rollback_all(&mut self) -> Vec<crate::undo::UndoRecord> {
        self.scopes.clear();
        self.clear_flag(HAS_SCOPE);
        self.undo.pop_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bogus_transaction_is_marked() {
        assert!(Transaction::bogus().is_bogus());
    }

    #[test]
    fn nested_scope_exit_rolls_back_only_inner() {
        let mut txn = Transaction::new(1, DurabilityMode::Sync, LockMode::UpgradableRead, 0);
        txn.undo_mut().push(crate::undo::UndoRecord::UnInsert { index_id: 1, key: b"outer".to_vec() });
        txn.enter();
        txn.undo_mut().push(crate::undo::UndoRecord::UnInsert { index_id: 1, key: b"inner".to_vec() });
        let popped = txn.exit();
        assert_eq!(popped.len(), 1);
        assert!(!txn.has_scope());
        assert_eq!(txn.undo().len(), 1);
    }

    #[test]
    fn commit_within_nested_scope_does_not_discard_outer() {
        let mut txn = Transaction::new(1, DurabilityMode::Sync, LockMode::UpgradableRead, 0);
        txn.enter();
        txn.undo_mut().push(crate::undo::UndoRecord::UnInsert { index_id: 1, key: b"a".to_vec() });
        let durable = txn.commit();
        assert!(!durable);
        assert!(!txn.undo().is_empty());
    }

    #[test]
    fn outermost_commit_discards_undo_log() {
        let mut txn = Transaction::new(1, DurabilityMode::Sync, LockMode::UpgradableRead, 0);
        txn.undo_mut().push(crate::undo::UndoRecord::UnInsert { index_id: 1, key: b"a".to_vec() });
        let durable = txn.commit();
        assert!(durable);
        assert!(txn.undo().is_empty());
    }
}
