//! End-to-end scenarios exercising `Database`/`BTree` the way a real caller
//! would, across a process-boundary simulation (close, drop, reopen).

use std::sync::Arc;

use tupl::config::DatabaseConfig;
use tupl::database::Database;
use tupl::page_array::{MemPageArray, PageArray};
use tupl::snapshot::Snapshot;
use tupl::tree::cursor::BTree;
use tupl::txn::{DurabilityMode, LockMode};
use tupl::{alloc::PageAllocator, cache::NodeCache};

fn cfg(base: std::path::PathBuf) -> DatabaseConfig {
    let mut c = DatabaseConfig::default();
    c.page_size(4096).base_file(base).checkpoint_rate_nanos(0);
    c
}

#[test]
fn simple_commit_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("db1");
    let config = cfg(base.clone());

    {
        let db = Database::open(&config).unwrap();
        let mut txn = db.begin();
        db.put(&mut txn, b"k1".to_vec(), b"v1".to_vec()).unwrap();
        db.commit(&mut txn).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&config).unwrap();
    let read = db.begin();
    assert_eq!(db.get(&read, b"k1").unwrap(), Some(b"v1".to_vec()));
}

#[test]
fn uncommitted_write_is_invisible_after_reset() {
    let dir = tempfile::tempdir().unwrap();
    let config = cfg(dir.path().join("db2"));
    let db = Database::open(&config).unwrap();

    let mut txn1 = db.begin();
    db.put(&mut txn1, b"k".to_vec(), b"v1".to_vec()).unwrap();
    db.commit(&mut txn1).unwrap();

    let mut txn2 = db.begin();
    db.put(&mut txn2, b"k".to_vec(), b"v2".to_vec()).unwrap();
    db.rollback(&mut txn2).unwrap();

    let read = db.begin();
    assert_eq!(db.get(&read, b"k").unwrap(), Some(b"v1".to_vec()));
}

#[test]
fn exactly_one_side_of_a_deadlock_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = cfg(dir.path().join("db3"));
    let db = Arc::new(Database::open(&config).unwrap());

    let mut setup = db.begin();
    db.put(&mut setup, b"k1".to_vec(), b"a".to_vec()).unwrap();
    db.put(&mut setup, b"k2".to_vec(), b"b".to_vec()).unwrap();
    db.commit(&mut setup).unwrap();

    let db1 = db.clone();
    let db2 = db.clone();
    let result = std::thread::scope(|s| {
        let h1 = s.spawn(move || {
            let mut t1 = db1.begin();
            t1.set_lock_timeout_nanos(2_000_000_000);
            db1.put(&mut t1, b"k1".to_vec(), b"1".to_vec()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(30));
            let r = db1.put(&mut t1, b"k2".to_vec(), b"1".to_vec());
            if r.is_ok() {
                db1.commit(&mut t1).unwrap();
            } else {
                db1.rollback(&mut t1).unwrap();
            }
            r.is_ok()
        });
        let h2 = s.spawn(move || {
            let mut t2 = db2.begin();
            t2.set_lock_timeout_nanos(2_000_000_000);
            db2.put(&mut t2, b"k2".to_vec(), b"2".to_vec()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(30));
            let r = db2.put(&mut t2, b"k1".to_vec(), b"2".to_vec());
            if r.is_ok() {
                db2.commit(&mut t2).unwrap();
            } else {
                db2.rollback(&mut t2).unwrap();
            }
            r.is_ok()
        });
        (h1.join().unwrap(), h2.join().unwrap())
    });
    assert!(result.0 != result.1, "exactly one side must fail: {result:?}");
}

#[test]
fn fragmented_large_value_round_trips_and_truncates() {
    let array: Arc<dyn PageArray> = Arc::new(MemPageArray::new(4096));
    array.set_page_count(2).unwrap();
    let alloc = Arc::new(PageAllocator::new(2));
    let cache = Arc::new(NodeCache::new(1000));
    let tree = Arc::new(
        BTree::open(array.clone(), alloc.clone(), cache.clone(), 4096, None, tupl::DEFAULT_INDEX_ID).unwrap(),
    );

    let mut cursor = tupl::tree::cursor::Cursor::new(tree.clone());
    cursor.find(b"blob").unwrap();
    let mut undo = tupl::undo::UndoLog::new(1);

    let chunk = vec![0xAB; 64 * 1024];
    let total = 10 * 1024 * 1024;
    let mut written = 0u64;
    while (written as usize) < total {
        cursor.value_write(written, &chunk, &mut undo).unwrap();
        written += chunk.len() as u64;
    }

    let len = cursor.value_length().unwrap().unwrap();
    assert_eq!(len, total as u64);
    let read_back = cursor.value_read(0, total).unwrap();
    assert!(read_back.iter().all(|&b| b == 0xAB));

    cursor.value_set_length(5 * 1024 * 1024, &mut undo).unwrap();
    let truncated_len = cursor.value_length().unwrap().unwrap();
    assert_eq!(truncated_len, 5 * 1024 * 1024);
    let prefix = cursor.value_read(0, 5 * 1024 * 1024).unwrap();
    assert!(prefix.iter().all(|&b| b == 0xAB));
}

#[test]
fn snapshot_preserves_original_state_through_concurrent_mutation() {
    let array: Arc<dyn PageArray> = Arc::new(MemPageArray::new(4096));
    array.set_page_count(2).unwrap();
    let alloc = Arc::new(PageAllocator::new(2));
    let cache = Arc::new(NodeCache::new(1000));
    let tree = Arc::new(
        BTree::open(array.clone(), alloc.clone(), cache.clone(), 4096, None, tupl::DEFAULT_INDEX_ID).unwrap(),
    );

    const N: usize = 2000;
    let mut undo = tupl::undo::UndoLog::new(1);
    for i in 0..N {
        let key = format!("k{i:06}").into_bytes();
        let value = format!("v{i}").into_bytes();
        let mut cursor = tupl::tree::cursor::Cursor::new(tree.clone());
        cursor.find(&key).unwrap();
        cursor.store(value, &mut undo).unwrap();
    }

    // Captured before any post-snapshot mutation: the snapshot stream only
    // covers pages that existed as of this root, since the page-array
    // snapshot itself carries no record of the tree's root pointer.
    let root_at_snapshot = tree.root();
    let snap = Snapshot::begin(array.clone());

    for i in 0..(N / 2) {
        let key = format!("k{i:06}").into_bytes();
        let mut cursor = tupl::tree::cursor::Cursor::new(tree.clone());
        cursor.find(&key).unwrap();
        cursor.store(b"mutated".to_vec(), &mut undo).unwrap();
    }

    let mut out = Vec::new();
    snap.write_to(&mut out).unwrap();
    snap.close();

    let dst: Arc<dyn PageArray> = Arc::new(MemPageArray::new(4096));
    dst.restore_from_snapshot(&mut &out[..]).unwrap();

    let dst_cache = Arc::new(NodeCache::new(1000));
    let dst_alloc = Arc::new(PageAllocator::new(2));
    // Re-derive the restored tree's root the same way recovery would: the
    // header isn't part of this raw-page snapshot, so the original tree's
    // root page id is reused directly against the restored array.
    let dst_tree = Arc::new(
        BTree::open(dst.clone(), dst_alloc, dst_cache, 4096, Some(root_at_snapshot), tupl::DEFAULT_INDEX_ID)
            .unwrap(),
    );

    for i in 0..N {
        let key = format!("k{i:06}").into_bytes();
        let expected = format!("v{i}").into_bytes();
        let mut cursor = tupl::tree::cursor::Cursor::new(dst_tree.clone());
        cursor.find(&key).unwrap();
        assert_eq!(cursor.load().unwrap(), Some(expected));
    }
}

#[test]
fn redo_recovery_replays_only_committed_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("db6");
    let mut config = DatabaseConfig::default();
    config
        .page_size(4096)
        .base_file(base.clone())
        .durability_mode(DurabilityMode::NoSync)
        .lock_mode(LockMode::UpgradableRead)
        .checkpoint_rate_nanos(0)
        .checkpoint_size_threshold(0);

    {
        let db = Database::open(&config).unwrap();
        for i in 0..200 {
            let mut txn = db.begin();
            db.put(&mut txn, format!("row{i:05}").into_bytes(), b"x".to_vec()).unwrap();
            db.commit(&mut txn).unwrap();
        }
        // Simulated crash: the process just stops here without an explicit
        // checkpoint or close, leaving the committed rows only in the redo
        // log plus whatever the checkpointer already folded in.
    }

    let db2 = Database::open(&config).unwrap();
    let read = db2.begin();
    for i in 0..200 {
        assert_eq!(
            db2.get(&read, format!("row{i:05}").into_bytes().as_slice()).unwrap(),
            Some(b"x".to_vec()),
            "row {i} missing after recovery"
        );
    }
}
