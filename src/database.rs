//! Database handle: glues C1–C12 together behind one open/close API.
//!
//! Owns the page array, allocator, node cache, lock manager, redo log and
//! checkpointer. The default tree (`DEFAULT_INDEX_ID`) is the only index
//! whose root lives in the durable header; every named secondary index
//! created via `create_index` is tracked in a catalog stored as ordinary
//! entries in the default tree (`catalog.rs`, `spec.md` §3: "index 0 is
//! reserved for the registry of indexes"), so it is just as durable, just as
//! redo-logged, and just as recoverable as the default tree itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::alloc::PageAllocator;
use crate::cache::NodeCache;
use crate::catalog;
use crate::checkpoint::{Checkpointer, Header};
use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult, LockResult};
use crate::listener::{EventListener, NullListener};
use crate::lock::LockManager;
use crate::page_array::{FilePageArray, MemPageArray, PageArray};
use crate::recovery;
use crate::redo::{RedoLog, RedoOp};
use crate::scheduler::RuntimeContext;
use crate::tree::cursor::{BTree, Cursor};
use crate::txn::{DurabilityMode, LockMode, Transaction};
use crate::undo::{self, UndoRecord, UndoSink};

/// Id of the one index recovery and checkpointing track a durable header
/// root for; every other index is reached through the catalog. Defined in
/// `tree::cursor` to avoid a cycle with `recovery.rs`.
pub use crate::tree::cursor::DEFAULT_INDEX_ID;

pub struct Database {
    array: Arc<dyn PageArray>,
    alloc: Arc<PageAllocator>,
    cache: Arc<NodeCache>,
    default_index: Arc<BTree>,
    indexes: Mutex<HashMap<u64, Arc<BTree>>>,
    names: Mutex<HashMap<Vec<u8>, u64>>,
    locks: Arc<LockManager>,
    redo: Arc<RedoLog>,
    pending_redo: Mutex<HashMap<u64, Vec<RedoOp>>>,
    checkpointer: Checkpointer,
    runtime: Arc<RuntimeContext>,
    listener: Arc<dyn EventListener>,
    config: DatabaseConfig,
    next_txn_id: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> DbResult<Arc<Self>> {
        Self::open_with_listener(config, Arc::new(NullListener))
    }

    pub fn open_with_listener(config: &DatabaseConfig, listener: Arc<dyn EventListener>) -> DbResult<Arc<Self>> {
        config.validate()?;
        let page_size = config.page_size;

        let (array, redo_path): (Arc<dyn PageArray>, PathBuf) = match &config.base_file {
            Some(base) => {
                let db_path = base.with_extension("db");
                let redo_path = base.with_extension("redo");
                let arr = FilePageArray::open(&db_path, page_size, 2)?;
                (Arc::new(arr) as Arc<dyn PageArray>, redo_path)
            }
            None => {
                let arr = MemPageArray::new(page_size);
                arr.set_page_count(2)?;
                let redo_path =
                    std::env::temp_dir().join(format!("tupl-temp-{:016x}.redo", rand::random::<u64>()));
                (Arc::new(arr) as Arc<dyn PageArray>, redo_path)
            }
        };

        let recovered = recovery::recover(array.clone(), [0, 1], &redo_path, page_size, listener.as_ref())?;

        // `recovery::recover` always performs one internal checkpoint before
        // returning, starting from slot 0 and advancing the generation by
        // one (`recovery.rs`); continue from what it actually left active
        // rather than re-using the pre-recovery slot/generation, or the
        // first live checkpoint would collide with the one recovery just
        // wrote.
        let header = Header::new(array.clone(), [0, 1]);
        let checkpointer = Checkpointer::new(header, recovered.report.header.generation + 1, 1);
        let redo = Arc::new(RedoLog::create_or_open(&redo_path)?);

        let db = Arc::new(Self {
            array,
            alloc: recovered.alloc,
            cache: recovered.cache,
            default_index: recovered.default_tree,
            indexes: Mutex::new(recovered.indexes),
            names: Mutex::new(recovered.names),
            locks: Arc::new(LockManager::new()),
            redo,
            pending_redo: Mutex::new(HashMap::new()),
            checkpointer,
            runtime: RuntimeContext::new(),
            listener,
            config: config.clone(),
            next_txn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        log::info!(
            "database opened (page_size={}, backed={})",
            config.page_size,
            config.base_file.is_some()
        );

        if config.checkpoint_rate_nanos > 0 {
            schedule_periodic_checkpoint(
                db.runtime.clone(),
                Arc::downgrade(&db),
                Duration::from_nanos(config.checkpoint_rate_nanos),
            );
        }

        Ok(db)
    }

    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.checkpoint()
    }

    pub fn checkpoint(&self) -> DbResult<()> {
        self.persist_index_roots()?;
        self.checkpointer.run(
            &self.cache,
            self.array.as_ref(),
            &self.alloc,
            &self.redo,
            self.default_index.root(),
            self.listener.as_ref(),
        )
    }

    /// Write every named index's current root page into its catalog entry
    /// before a checkpoint runs. The catalog lives in the default tree, so
    /// this is an ordinary write the checkpoint's own dirty-page flush picks
    /// up in the same pass; without it, a split or merge that changed a
    /// named index's root between checkpoints would be lost, leaving the
    /// catalog pointing at a stale root after restart.
    fn persist_index_roots(&self) -> DbResult<()> {
        let indexes = self.indexes.lock().unwrap();
        let names = self.names.lock().unwrap();
        for (name, id) in names.iter() {
            if let Some(tree) = indexes.get(id) {
                catalog::update_root(&self.default_index, *id, name, tree.root())?;
            }
        }
        Ok(())
    }

    fn maybe_checkpoint(&self) -> DbResult<()> {
        if self.config.checkpoint_size_threshold == 0 {
            return Ok(());
        }
        let len = std::fs::metadata(self.redo.path()).map(|m| m.len()).unwrap_or(0);
        if len >= self.config.checkpoint_size_threshold {
            self.checkpoint()?;
        }
        Ok(())
    }

    pub fn begin(&self) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction::new(id, self.config.durability_mode, self.config.lock_mode, self.config.lock_timeout_nanos)
    }

    fn lock_timeout(&self, txn: &Transaction) -> Option<Duration> {
        let nanos = txn.lock_timeout_nanos();
        if nanos < 0 {
            None
        } else {
            Some(Duration::from_nanos(nanos as u64))
        }
    }

    fn check_txn(&self, txn: &Transaction) -> DbResult<()> {
        if txn.is_borked().is_some() {
            return Err(DbError::InvalidTransaction);
        }
        Ok(())
    }

    /// Turn a [`LockResult`] into a `DbResult`, notifying the listener first
    /// if the result is a detected deadlock (`spec.md` §4.5, §7).
    fn check_lock_result(&self, result: LockResult) -> DbResult<()> {
        if let LockResult::Deadlock(ref info) = result {
            self.listener.deadlock(info);
        }
        if !result.is_owned() {
            return Err(result.into());
        }
        Ok(())
    }

    fn tree_for(&self, index_id: u64) -> DbResult<Arc<BTree>> {
        if index_id == DEFAULT_INDEX_ID {
            return Ok(self.default_index.clone());
        }
        self.indexes
            .lock()
            .unwrap()
            .get(&index_id)
            .cloned()
            .ok_or(DbError::UnknownIndex(index_id))
    }

    fn queue_redo(&self, txn_id: u64, op: RedoOp) {
        self.pending_redo.lock().unwrap().entry(txn_id).or_default().push(op);
    }

    /// A raw, untracked cursor over `index_id`, for callers that want to
    /// drive multi-step traversal directly rather than through `get`/`put`.
    pub fn open_cursor(&self, index_id: u64) -> DbResult<Cursor> {
        Ok(Cursor::new(self.tree_for(index_id)?))
    }

    pub fn get(&self, txn: &Transaction, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.get_in(txn, DEFAULT_INDEX_ID, key)
    }

    pub fn put(&self, txn: &mut Transaction, key: Vec<u8>, value: Vec<u8>) -> DbResult<()> {
        self.put_in(txn, DEFAULT_INDEX_ID, key, value)
    }

    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> DbResult<bool> {
        self.delete_in(txn, DEFAULT_INDEX_ID, key)
    }

    pub fn get_in(&self, txn: &Transaction, index_id: u64, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.check_txn(txn)?;
        if key.is_empty() {
            return Err(DbError::NullKey);
        }
        // `spec.md` §6: lock mode governs how long (if at all) a read holds
        // its lock. `Unsafe`/`ReadUncommitted` take none; `ReadCommitted`
        // takes and immediately drops a shared lock; `RepeatableRead` holds
        // it for the rest of the transaction; `UpgradableRead` holds an
        // upgradable lock so a later write can promote in place.
        match txn.lock_mode() {
            LockMode::Unsafe | LockMode::ReadUncommitted => {}
            LockMode::ReadCommitted => {
                let timeout = self.lock_timeout(txn);
                let result = self.locks.lock_shared(txn.id(), index_id, key, timeout);
                self.check_lock_result(result)?;
                self.locks.unlock(txn.id(), index_id, key);
            }
            LockMode::RepeatableRead => {
                let timeout = self.lock_timeout(txn);
                let result = self.locks.lock_shared(txn.id(), index_id, key, timeout);
                self.check_lock_result(result)?;
            }
            LockMode::UpgradableRead => {
                let timeout = self.lock_timeout(txn);
                let result = self.locks.lock_upgradable(txn.id(), index_id, key, timeout);
                self.check_lock_result(result)?;
            }
        }
        let tree = self.tree_for(index_id)?;
        let mut cursor = Cursor::new(tree);
        cursor.find(key)?;
        cursor.load()
    }

    pub fn put_in(&self, txn: &mut Transaction, index_id: u64, key: Vec<u8>, value: Vec<u8>) -> DbResult<()> {
        self.check_txn(txn)?;
        if key.is_empty() {
            return Err(DbError::NullKey);
        }
        if txn.lock_mode() != LockMode::Unsafe {
            let timeout = self.lock_timeout(txn);
            let result = self.locks.lock_exclusive(txn.id(), index_id, &key, timeout);
            self.check_lock_result(result)?;
        }
        let tree = self.tree_for(index_id)?;
        let mut cursor = Cursor::new(tree);
        cursor.find(&key)?;
        let redo_value = value.clone();
        cursor.store(value, txn.undo_mut())?;
        if txn.durability_mode() != DurabilityMode::NoRedo {
            self.queue_redo(
                txn.id(),
                RedoOp::Store { txn_id: txn.id(), index_id, key, value: redo_value },
            );
        }
        Ok(())
    }

    pub fn delete_in(&self, txn: &mut Transaction, index_id: u64, key: &[u8]) -> DbResult<bool> {
        self.check_txn(txn)?;
        if key.is_empty() {
            return Err(DbError::NullKey);
        }
        if txn.lock_mode() != LockMode::Unsafe {
            let timeout = self.lock_timeout(txn);
            let result = self.locks.lock_exclusive(txn.id(), index_id, key, timeout);
            self.check_lock_result(result)?;
        }
        let ghost = txn.lock_mode() != LockMode::Unsafe;
        let tree = self.tree_for(index_id)?;
        let mut cursor = Cursor::new(tree);
        cursor.find(key)?;
        let existed = cursor.delete(ghost, txn.undo_mut())?;
        if existed && txn.durability_mode() != DurabilityMode::NoRedo {
            self.queue_redo(
                txn.id(),
                RedoOp::Delete { txn_id: txn.id(), index_id, key: key.to_vec() },
            );
        }
        Ok(existed)
    }

    pub fn enter_scope(&self, txn: &mut Transaction) {
        txn.enter();
    }

    pub fn exit_scope(&self, txn: &mut Transaction) -> DbResult<()> {
        let records = txn.exit();
        let mut sink = TreeUndoSink { db: self };
        undo::rollback(&records, &mut sink)
    }

    pub fn commit(&self, txn: &mut Transaction) -> DbResult<()> {
        self.check_txn(txn)?;
        let durable = txn.commit();
        if !durable {
            return Ok(());
        }
        let txn_id = txn.id();
        let mode = txn.durability_mode();
        let ops = self.pending_redo.lock().unwrap().remove(&txn_id).unwrap_or_default();

        if ops.is_empty() || mode == DurabilityMode::NoRedo {
            self.locks.unlock_all(txn_id);
            self.maybe_checkpoint()?;
            return Ok(());
        }

        // `spec.md` §4.8 pending-commit queue: lock ownership (and, for
        // `NoSync`, the fsync itself) transfers to a background worker for
        // any mode weaker than `Sync`, so `commit` doesn't block the caller
        // on disk. `Sync` stays fully synchronous since callers of that mode
        // expect durability to already hold by the time commit returns.
        match mode {
            DurabilityMode::Sync => {
                self.redo.append_batch(txn_id, &ops, mode)?;
                self.locks.unlock_all(txn_id);
            }
            DurabilityMode::NoFlush => {
                for op in &ops {
                    self.redo.append(op)?;
                }
                self.redo.append(&RedoOp::TxnCommit { txn_id })?;
                self.locks.unlock_all(txn_id);
            }
            DurabilityMode::NoSync => {
                for op in &ops {
                    self.redo.append(op)?;
                }
                self.redo.append(&RedoOp::TxnCommit { txn_id })?;
                let locks = self.locks.clone();
                let redo = self.redo.clone();
                self.runtime.pool.submit(move || {
                    if let Err(e) = redo.sync() {
                        log::error!("background redo sync failed for txn {txn_id}: {e}");
                    }
                    locks.unlock_all(txn_id);
                });
            }
            DurabilityMode::NoRedo => unreachable!("handled above"),
        }

        self.maybe_checkpoint()?;
        Ok(())
    }

    pub fn rollback(&self, txn: &mut Transaction) -> DbResult<()> {
        let records = txn.rollback_all();
        let mut sink = TreeUndoSink { db: self };
        undo::rollback(&records, &mut sink)?;
        self.pending_redo.lock().unwrap().remove(&txn.id());
        self.locks.unlock_all(txn.id());
        Ok(())
    }

    /// Create a new named secondary index, durably registered in the
    /// catalog and redo-logged like any other write (`spec.md` §3).
    pub fn create_index(&self, name: &[u8]) -> DbResult<u64> {
        let mut names = self.names.lock().unwrap();
        if names.contains_key(name) {
            return Err(DbError::DuplicateIndexName);
        }
        let mut indexes = self.indexes.lock().unwrap();
        let id = loop {
            let candidate = loop {
                let v = rand::random::<u64>();
                if v != 0 && v != DEFAULT_INDEX_ID {
                    break v;
                }
            };
            if !indexes.contains_key(&candidate) {
                break candidate;
            }
        };
        let tree = Arc::new(BTree::open(
            self.array.clone(),
            self.alloc.clone(),
            self.cache.clone(),
            self.config.page_size,
            None,
            id,
        )?);
        catalog::put_entry(&self.default_index, id, name, tree.root())?;
        self.redo.append(&RedoOp::CreateIndex { index_id: id, name: name.to_vec() })?;
        self.redo.sync()?;
        indexes.insert(id, tree);
        names.insert(name.to_vec(), id);
        Ok(id)
    }

    pub fn find_index(&self, name: &[u8]) -> Option<u64> {
        self.names.lock().unwrap().get(name).copied()
    }

    pub fn drop_index(&self, name: &[u8]) -> DbResult<bool> {
        let Some(id) = self.names.lock().unwrap().remove(name) else {
            return Ok(false);
        };
        self.indexes.lock().unwrap().remove(&id);
        catalog::remove_entry(&self.default_index, id)?;
        self.redo.append(&RedoOp::DropIndex { index_id: id })?;
        self.redo.sync()?;
        // TODO: walk and free the dropped index's own node/value pages; the
        // catalog and in-memory map entries are gone but the tree's backing
        // pages are currently leaked until the next full-file compaction.
        Ok(true)
    }
}

/// Applies undo records back onto the right tree, dispatching on each
/// record's `index_id` rather than assuming the default tree (`spec.md` §8
/// item 3: rollback must work against any index, not just the default one).
struct TreeUndoSink<'a> {
    db: &'a Database,
}

impl UndoSink for TreeUndoSink<'_> {
    fn apply(&mut self, record: &UndoRecord) -> DbResult<()> {
        match record {
            UndoRecord::UnInsert { index_id, key } => {
                self.db.tree_for(*index_id)?.delete(key, false)?;
            }
            UndoRecord::UnUpdate { index_id, key, old_value }
            | UndoRecord::UnWrite { index_id, key, old_value }
            | UndoRecord::UnExtend { index_id, key, old_value }
            | UndoRecord::UnDelete { index_id, key, old_value }
            | UndoRecord::UnDeleteFragmented { index_id, key, old_value } => {
                self.db.tree_for(*index_id)?.insert(key, old_value.clone())?;
            }
            UndoRecord::UnAlloc { page } => {
                self.db.alloc.free(*page);
            }
            UndoRecord::UnCreate { index_id } => {
                self.db.indexes.lock().unwrap().remove(index_id);
                self.db.names.lock().unwrap().retain(|_, v| *v != *index_id);
                let _ = catalog::remove_entry(&self.db.default_index, *index_id);
            }
            UndoRecord::Prepare { .. } | UndoRecord::Custom { .. } | UndoRecord::ScopeMark | UndoRecord::Commit => {}
        }
        Ok(())
    }
}

fn schedule_periodic_checkpoint(runtime: Arc<RuntimeContext>, weak: Weak<Database>, rate: Duration) {
    let runtime_clone = runtime.clone();
    let weak_clone = weak.clone();
    runtime.delays.schedule(rate, move || {
        if let Some(db) = weak.upgrade() {
            if !db.closed.load(Ordering::SeqCst) {
                if let Err(e) = db.checkpoint() {
                    log::error!("periodic checkpoint failed: {e}");
                }
                schedule_periodic_checkpoint(runtime_clone, weak_clone, rate);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> Arc<Database> {
        let mut config = DatabaseConfig::default();
        config.page_size(512).checkpoint_rate_nanos(0);
        Database::open(&config).unwrap()
    }

    #[test]
    fn put_get_delete_round_trip_within_committed_transaction() {
        let db = open_temp();
        let mut txn = db.begin();
        db.put(&mut txn, b"k".to_vec(), b"v".to_vec()).unwrap();
        db.commit(&mut txn).unwrap();

        let read_txn = db.begin();
        assert_eq!(db.get(&read_txn, b"k").unwrap(), Some(b"v".to_vec()));

        let mut del_txn = db.begin();
        assert!(db.delete(&mut del_txn, b"k").unwrap());
        db.commit(&mut del_txn).unwrap();

        let read_txn2 = db.begin();
        assert_eq!(db.get(&read_txn2, b"k").unwrap(), None);
    }

    #[test]
    fn rollback_restores_prior_value() {
        let db = open_temp();
        let mut setup = db.begin();
        db.put(&mut setup, b"k".to_vec(), b"v1".to_vec()).unwrap();
        db.commit(&mut setup).unwrap();

        let mut txn = db.begin();
        db.put(&mut txn, b"k".to_vec(), b"v2".to_vec()).unwrap();
        db.rollback(&mut txn).unwrap();

        let read_txn = db.begin();
        assert_eq!(db.get(&read_txn, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn rollback_restores_prior_value_in_a_named_index_too() {
        let db = open_temp();
        let idx = db.create_index(b"secondary").unwrap();

        let mut setup = db.begin();
        db.put_in(&mut setup, idx, b"k".to_vec(), b"v1".to_vec()).unwrap();
        db.commit(&mut setup).unwrap();

        let mut txn = db.begin();
        db.put_in(&mut txn, idx, b"k".to_vec(), b"v2".to_vec()).unwrap();
        db.rollback(&mut txn).unwrap();

        let read_txn = db.begin();
        assert_eq!(db.get_in(&read_txn, idx, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn nested_scope_exit_rolls_back_only_inner_scope() {
        let db = open_temp();
        let mut txn = db.begin();
        db.put(&mut txn, b"outer".to_vec(), b"1".to_vec()).unwrap();
        db.enter_scope(&mut txn);
        db.put(&mut txn, b"inner".to_vec(), b"2".to_vec()).unwrap();
        db.exit_scope(&mut txn).unwrap();
        db.commit(&mut txn).unwrap();

        let read_txn = db.begin();
        assert_eq!(db.get(&read_txn, b"outer").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(&read_txn, b"inner").unwrap(), None);
    }

    #[test]
    fn named_index_is_isolated_from_default() {
        let db = open_temp();
        let idx = db.create_index(b"secondary").unwrap();
        assert_eq!(db.find_index(b"secondary"), Some(idx));

        let mut txn = db.begin();
        db.put_in(&mut txn, idx, b"k".to_vec(), b"side".to_vec()).unwrap();
        db.put(&mut txn, b"k".to_vec(), b"main".to_vec()).unwrap();
        db.commit(&mut txn).unwrap();

        let read_txn = db.begin();
        assert_eq!(db.get_in(&read_txn, idx, b"k").unwrap(), Some(b"side".to_vec()));
        assert_eq!(db.get(&read_txn, b"k").unwrap(), Some(b"main".to_vec()));

        assert!(db.drop_index(b"secondary").unwrap());
        assert_eq!(db.find_index(b"secondary"), None);
    }

    #[test]
    fn checkpoint_then_reopen_recovers_committed_data() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mydb");
        let mut config = DatabaseConfig::default();
        config.page_size(512).base_file(base.clone()).checkpoint_rate_nanos(0);

        {
            let db = Database::open(&config).unwrap();
            let mut txn = db.begin();
            db.put(&mut txn, b"k".to_vec(), b"persisted".to_vec()).unwrap();
            db.commit(&mut txn).unwrap();
            db.close().unwrap();
        }

        let db2 = Database::open(&config).unwrap();
        let read_txn = db2.begin();
        assert_eq!(db2.get(&read_txn, b"k").unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn checkpoint_then_reopen_recovers_a_named_index_and_its_current_root() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mydb2");
        let mut config = DatabaseConfig::default();
        config.page_size(512).base_file(base.clone()).checkpoint_rate_nanos(0);

        let idx_before;
        {
            let db = Database::open(&config).unwrap();
            let idx = db.create_index(b"secondary").unwrap();
            idx_before = idx;
            let mut txn = db.begin();
            // Enough entries to force at least one split, moving the root.
            for i in 0..100u32 {
                let k = format!("k{:04}", i).into_bytes();
                db.put_in(&mut txn, idx, k, b"v".to_vec()).unwrap();
            }
            db.commit(&mut txn).unwrap();
            db.close().unwrap();
        }

        let db2 = Database::open(&config).unwrap();
        assert_eq!(db2.find_index(b"secondary"), Some(idx_before));
        let read_txn = db2.begin();
        assert_eq!(
            db2.get_in(&read_txn, idx_before, b"k0050").unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn read_committed_releases_lock_before_returning() {
        let db = open_temp();
        let mut setup = db.begin();
        db.put(&mut setup, b"k".to_vec(), b"v".to_vec()).unwrap();
        db.commit(&mut setup).unwrap();

        let mut reader = db.begin();
        reader.set_lock_mode(LockMode::ReadCommitted);
        db.get(&reader, b"k").unwrap();

        // A concurrent exclusive writer should not be blocked by the read
        // that already returned: `ReadCommitted` holds its lock only for
        // the instant of the read.
        let mut writer = db.begin();
        db.put(&mut writer, b"k".to_vec(), b"v2".to_vec()).unwrap();
        db.commit(&mut writer).unwrap();

        let check = db.begin();
        assert_eq!(db.get(&check, b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn deadlock_is_reported_to_the_listener() {
        use crate::listener::{CheckpointPhase, RecoveryPhase};
        use std::sync::atomic::AtomicUsize;

        struct CountingListener {
            count: AtomicUsize,
        }
        impl EventListener for CountingListener {
            fn checkpoint(&self, _phase: CheckpointPhase) {}
            fn recovery(&self, _phase: RecoveryPhase) {}
            fn deadlock(&self, _info: &crate::error::DeadlockInfo) {
                self.count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut config = DatabaseConfig::default();
        config.page_size(512).checkpoint_rate_nanos(0);
        let listener = Arc::new(CountingListener { count: AtomicUsize::new(0) });
        let db = Database::open_with_listener(&config, listener.clone()).unwrap();

        let mut t1 = db.begin();
        t1.set_lock_timeout_nanos(500_000_000);
        db.put(&mut t1, b"a".to_vec(), b"1".to_vec()).unwrap();
        let mut t2 = db.begin();
        t2.set_lock_timeout_nanos(500_000_000);
        db.put(&mut t2, b"b".to_vec(), b"1".to_vec()).unwrap();

        std::thread::scope(|s| {
            let db1 = &db;
            let h = s.spawn(move || db1.put(&mut t1, b"b".to_vec(), b"2".to_vec()));
            std::thread::sleep(Duration::from_millis(20));
            let r2 = db.put(&mut t2, b"a".to_vec(), b"2".to_vec());
            let r1 = h.join().unwrap();
            assert!(r1.is_err() || r2.is_err());
        });

        assert!(listener.count.load(Ordering::SeqCst) >= 1);
    }
}
