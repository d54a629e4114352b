//! Recovery (C11, `spec.md` §4.11).
//!
//! Run once, synchronously, when a database is opened on a file that was
//! not closed cleanly. Fixed sequence: read back the newer of the two
//! header slots, open the default tree and allocator at that point,
//! reconstruct the secondary-index catalog as of the last checkpoint,
//! replay the redo log forward (against the right tree for each record's
//! `index_id`), drain the fragmented-value trash, then checkpoint once to
//! fold the replay back into a clean state. Every step is idempotent:
//! replaying an already-applied redo record, or dropping an
//! already-dropped transaction's buffered ops, is a no-op, so a crash
//! during recovery itself is safe to simply restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::alloc::PageAllocator;
use crate::cache::NodeCache;
use crate::catalog;
use crate::checkpoint::{Checkpointer, Header, HeaderSlot};
use crate::error::DbResult;
use crate::listener::{EventListener, RecoveryPhase};
use crate::page_array::PageArray;
use crate::redo::{RedoLog, RedoOp};
use crate::tree::cursor::{BTree, DEFAULT_INDEX_ID};
use crate::tree::node::ValueRepr;

/// Outcome of a recovery pass, handed back to the database opener.
pub struct RecoveryReport {
    pub replayed_ops: usize,
    pub rolled_back_txns: usize,
    pub header: HeaderSlot,
}

/// Everything recovery settled on: the default tree, the shared allocator
/// and node cache, every secondary index reconstructed from the catalog
/// (keyed by id and by name), and a summary report.
pub struct RecoveredState {
    pub default_tree: Arc<BTree>,
    pub alloc: Arc<PageAllocator>,
    pub cache: Arc<NodeCache>,
    pub indexes: HashMap<u64, Arc<BTree>>,
    pub names: HashMap<Vec<u8>, u64>,
    pub report: RecoveryReport,
}

/// Run recovery against an already-open page array, returning the tree
/// state recovery settled on.
pub fn recover(
    array: Arc<dyn PageArray>,
    header_slot_pages: [u64; 2],
    redo_log_path: &Path,
    page_size: usize,
    listener: &dyn EventListener,
) -> DbResult<RecoveredState> {
    log::info!("recovery starting");
    let header = Header::new(array.clone(), header_slot_pages);
    let slot = header.read_latest()?.unwrap_or(HeaderSlot {
        generation: 0,
        root_page: 0,
        allocator_root: 0,
        allocator_next_page: header_slot_pages[1] + 1,
        checksum: 0,
    });

    let cache = Arc::new(NodeCache::new(10_000));
    let alloc = Arc::new(PageAllocator::load_allocator(
        array.as_ref(),
        slot.allocator_root,
        header_slot_pages[1] + 1,
        slot.allocator_next_page.max(header_slot_pages[1] + 1),
    )?);
    let root_page = if slot.root_page == 0 { None } else { Some(slot.root_page) };
    let default_tree = Arc::new(BTree::open(
        array.clone(),
        alloc.clone(),
        cache.clone(),
        page_size,
        root_page,
        DEFAULT_INDEX_ID,
    )?);

    // Reconstruct every secondary index that existed as of the last
    // checkpoint from the catalog stored in the default tree (`spec.md` §3:
    // "index 0 is reserved for the registry of indexes"). Indexes created
    // since that checkpoint are rebuilt below as their `CreateIndex` redo
    // records are replayed.
    let mut indexes: HashMap<u64, Arc<BTree>> = HashMap::new();
    let mut names: HashMap<Vec<u8>, u64> = HashMap::new();
    for entry in catalog::scan_all(&default_tree)? {
        let tree = Arc::new(BTree::open(
            array.clone(),
            alloc.clone(),
            cache.clone(),
            page_size,
            Some(entry.root_page),
            entry.index_id,
        )?);
        names.insert(entry.name, entry.index_id);
        indexes.insert(entry.index_id, tree);
    }

    listener.recovery(RecoveryPhase::ReplayingRedo);

    // Replay the redo log: per-transaction buffers are held until that
    // transaction's commit marker is seen, so a transaction whose commit
    // never made it into the log contributes nothing (`spec.md` §4.11 step
    // 3, idempotent replay). Each buffered op carries its own `txn_id`
    // (`spec.md` §4.8: appends take the file mutex per record, not per
    // batch, so concurrent transactions' records can interleave), so
    // bucketing by it is required for correctness, not just tidiness.
    // `CreateIndex`/`DropIndex` are administrative, not part of any user
    // transaction's undo scope, so they apply as soon as they're seen.
    let mut pending: HashMap<u64, Vec<RedoOp>> = HashMap::new();
    let mut replayed = 0usize;
    RedoLog::replay(redo_log_path, |op| {
        match op {
            RedoOp::TxnCommit { txn_id } => {
                if let Some(ops) = pending.remove(&txn_id) {
                    for op in ops {
                        apply_redo_op(&default_tree, &mut indexes, &mut names, &array, &alloc, &cache, page_size, op)?;
                        replayed += 1;
                    }
                }
            }
            RedoOp::CreateIndex { .. } | RedoOp::DropIndex { .. } => {
                apply_redo_op(&default_tree, &mut indexes, &mut names, &array, &alloc, &cache, page_size, op)?;
                replayed += 1;
            }
            RedoOp::TxnPrepare { .. } | RedoOp::CheckpointMark { .. } => {}
            RedoOp::Store { txn_id, .. } | RedoOp::Delete { txn_id, .. } => {
                pending.entry(txn_id).or_default().push(op);
            }
        }
        Ok(())
    })?;

    // Any buffered ops with no matching commit never committed: they are
    // simply dropped, since they were never applied to any tree.
    let rolled_back_txns = pending.len();
    if rolled_back_txns > 0 {
        log::warn!("recovery dropped {rolled_back_txns} uncommitted transaction(s)");
    }

    listener.recovery(RecoveryPhase::RollingBackUndo);
    // Rolling back already-applied-but-uncommitted in-memory undo logs is
    // the live transaction layer's responsibility at open time (the undo
    // log itself never touched disk in this design; see `DESIGN.md`), so
    // there is nothing further to replay here.

    listener.recovery(RecoveryPhase::DrainingTrash);
    drain_trash(&default_tree)?;

    listener.recovery(RecoveryPhase::Complete);

    let header_for_checkpoint = Header::new(array.clone(), header_slot_pages);
    let checkpointer = Checkpointer::new(header_for_checkpoint, slot.generation, 0);
    let redo = RedoLog::create_or_open(redo_log_path)?;
    checkpointer.run(&cache, array.as_ref(), &alloc, &redo, default_tree.root(), listener)?;
    log::info!("recovery complete: replayed {replayed} op(s), dropped {rolled_back_txns} txn(s)");

    Ok(RecoveredState {
        default_tree,
        alloc,
        cache,
        indexes,
        names,
        report: RecoveryReport {
            replayed_ops: replayed,
            rolled_back_txns,
            header: slot,
        },
    })
}

/// Apply one redo record during replay. `Store`/`Delete` resolve to the
/// tree named by their `index_id` (`spec.md` §8 item 3); `CreateIndex`
/// constructs the tree (if this is the first time it's seen since the last
/// checkpoint) and records it in the catalog; `DropIndex` removes it from
/// both the in-memory map and the catalog.
fn apply_redo_op(
    default_tree: &Arc<BTree>,
    indexes: &mut HashMap<u64, Arc<BTree>>,
    names: &mut HashMap<Vec<u8>, u64>,
    array: &Arc<dyn PageArray>,
    alloc: &Arc<PageAllocator>,
    cache: &Arc<NodeCache>,
    page_size: usize,
    op: RedoOp,
) -> DbResult<()> {
    match op {
        RedoOp::Store { index_id, key, value, .. } => {
            let tree = tree_for(default_tree, indexes, index_id)?;
            let repr = if value.len() <= crate::tree::fragment::inline_threshold(tree.page_size()) {
                ValueRepr::Inline(value)
            } else {
                crate::tree::fragment::fragment_value(
                    &value,
                    tree.page_size(),
                    tree.allocator(),
                    tree.array().as_ref(),
                )?
            };
            tree.insert(&key, repr)
        }
        RedoOp::Delete { index_id, key, .. } => {
            let tree = tree_for(default_tree, indexes, index_id)?;
            tree.delete(&key, false)?;
            Ok(())
        }
        RedoOp::CreateIndex { index_id, name } => {
            if !indexes.contains_key(&index_id) {
                let tree = Arc::new(BTree::open(array.clone(), alloc.clone(), cache.clone(), page_size, None, index_id)?);
                catalog::put_entry(default_tree, index_id, &name, tree.root())?;
                names.insert(name, index_id);
                indexes.insert(index_id, tree);
            }
            Ok(())
        }
        RedoOp::DropIndex { index_id } => {
            indexes.remove(&index_id);
            names.retain(|_, v| *v != index_id);
            catalog::remove_entry(default_tree, index_id)?;
            Ok(())
        }
        RedoOp::TxnCommit { .. } | RedoOp::TxnPrepare { .. } | RedoOp::CheckpointMark { .. } => Ok(()),
    }
}

fn tree_for(default_tree: &Arc<BTree>, indexes: &HashMap<u64, Arc<BTree>>, index_id: u64) -> DbResult<Arc<BTree>> {
    if index_id == DEFAULT_INDEX_ID {
        return Ok(default_tree.clone());
    }
    indexes
        .get(&index_id)
        .cloned()
        .ok_or(crate::error::DbError::UnknownIndex(index_id))
}

/// Free the pages behind every entry still queued in the fragmented-value
/// trash (`spec.md` §4.6 "FragmentedTrash", §4.11 step 5). This crate keeps
/// trash entries as ordinary tree entries under reserved key prefix
/// `\xFF\xFFtrash`, rather than a dedicated hidden index, to avoid adding a
/// second index-catalog entry just for recovery's sake.
fn drain_trash(tree: &Arc<BTree>) -> DbResult<()> {
    const TRASH_PREFIX: &[u8] = b"\xFF\xFFtrash";
    let mut cursor = tree.find_ge(TRASH_PREFIX)?;
    while let Some(entry) = &cursor {
        if !entry.key().starts_with(TRASH_PREFIX) {
            break;
        }
        if let crate::tree::node::Entry::Leaf { key, value } = entry {
            crate::tree::fragment::free_fragmented_pages(
                value,
                tree.page_size(),
                tree.allocator(),
                tree.array().as_ref(),
            )?;
            let key = key.clone();
            tree.delete(&key, false)?;
            cursor = tree.find_gt(&key)?;
        } else {
            break;
        }
    }
    Ok(())
}
