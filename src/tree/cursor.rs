//! The B-tree proper and its cursor contract (C6, `spec.md` §4.6).
//!
//! `BTree` owns the structural algorithms (descent, split, merge,
//! rebalance); `Cursor` is a lightweight, re-derivable position over it.
//! Rather than caching a root-to-leaf path and patching it in place as the
//! tree mutates underneath it (the teacher's `crab-dads::btree` approach),
//! this cursor keeps only the last key it visited and re-descends from the
//! root on every move. That costs an extra `O(log n)` per step but means a
//! structural change anywhere else in the tree (another cursor's insert, a
//! concurrent split) can never leave this cursor pointing at a stale or
//! freed page.

use std::sync::{Arc, Mutex};

use crate::alloc::PageAllocator;
use crate::cache::NodeCache;
use crate::error::{DbError, DbResult};
use crate::page_array::PageArray;
use crate::tree::fragment;
use crate::tree::node::{Entry, Node, ValueRepr};
use crate::undo::{UndoLog, UndoRecord};

/// The id every fresh [`crate::database::Database`] reserves for its
/// always-present default index (`spec.md` §3: "index 0 is reserved for the
/// registry of indexes"). Defined here, rather than in `database.rs`, so
/// `recovery.rs` can depend on it without a cycle back through the database
/// module; `database.rs` re-exports it for callers.
pub const DEFAULT_INDEX_ID: u64 = 1;

/// A single B-tree index (`spec.md` §3, §4.6).
pub struct BTree {
    array: Arc<dyn PageArray>,
    alloc: Arc<PageAllocator>,
    cache: Arc<NodeCache>,
    root: Mutex<u64>,
    page_size: usize,
    index_id: u64,
}

impl BTree {
    /// Open an existing tree rooted at `root_page`, or create a fresh empty
    /// one if `root_page` is `None`. `index_id` tags every undo/redo record
    /// this tree's cursors produce, so rollback and replay can dispatch back
    /// to the correct index (`spec.md` §8 item 3).
    pub fn open(
        array: Arc<dyn PageArray>,
        alloc: Arc<PageAllocator>,
        cache: Arc<NodeCache>,
        page_size: usize,
        root_page: Option<u64>,
        index_id: u64,
    ) -> DbResult<Self> {
        let root = match root_page {
            Some(p) => p,
            None => {
                let p = alloc.alloc()?.page;
                let leaf = Node::new_leaf(page_size);
                array.write_page(p, &leaf.encode())?;
                p
            }
        };
        Ok(Self {
            array,
            alloc,
            cache,
            root: Mutex::new(root),
            page_size,
            index_id,
        })
    }

    pub fn index_id(&self) -> u64 {
        self.index_id
    }

    pub fn root(&self) -> u64 {
        *self.root.lock().unwrap()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn array(&self) -> &Arc<dyn PageArray> {
        &self.array
    }

    pub fn allocator(&self) -> &Arc<PageAllocator> {
        &self.alloc
    }

    fn load_node(&self, page_id: u64) -> DbResult<Node> {
        if let Some(n) = self.cache.get_by_page(page_id) {
            return Ok(n);
        }
        let mut buf = vec![0u8; self.page_size];
        self.array.read_page(page_id, &mut buf)?;
        let node = Node::decode(&buf, self.page_size)?;
        let array = self.array.clone();
        self.cache.put(page_id, node.clone(), false, move |pid, n| {
            array.write_page(pid, &n.encode())
        })?;
        Ok(node)
    }

    fn store_node(&self, page_id: u64, node: &Node) -> DbResult<()> {
        self.array.write_page(page_id, &node.encode())?;
        self.cache.invalidate(page_id);
        let array = self.array.clone();
        self.cache.put(page_id, node.clone(), false, move |pid, n| {
            array.write_page(pid, &n.encode())
        })?;
        Ok(())
    }

    fn alloc_page(&self) -> DbResult<u64> {
        Ok(self.alloc.alloc()?.page)
    }

    fn free_page(&self, page_id: u64) {
        self.cache.invalidate(page_id);
        self.alloc.free(page_id);
    }

    // --- structural mutation --------------------------------------------

    /// Insert or overwrite `key` with `value`.
    pub fn insert(&self, key: &[u8], value: ValueRepr) -> DbResult<()> {
        if key.is_empty() {
            return Err(DbError::NullKey);
        }
        let root = self.root();
        if let Some((sep_key, right_page)) = self.insert_recursive(root, key, value)? {
            let mut new_root = Node::new_internal(self.page_size);
            new_root.insert_internal(Vec::new(), root);
            new_root.insert_internal(sep_key, right_page);
            let new_root_page = self.alloc_page()?;
            self.store_node(new_root_page, &new_root)?;
            *self.root.lock().unwrap() = new_root_page;
        }
        Ok(())
    }

    fn insert_recursive(
        &self,
        page_id: u64,
        key: &[u8],
        value: ValueRepr,
    ) -> DbResult<Option<(Vec<u8>, u64)>> {
        let mut node = self.load_node(page_id)?;
        if node.is_leaf() {
            node.insert_leaf(key.to_vec(), value);
        } else {
            let child_idx = node.child_index_for(key);
            let child_page = match &node.entries[child_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            if let Some((sep_key, new_child)) = self.insert_recursive(child_page, key, value)? {
                node.insert_internal(sep_key, new_child);
            }
        }

        if node.fits() {
            self.store_node(page_id, &node)?;
            Ok(None)
        } else {
            let right = node.split();
            let right_page = self.alloc_page()?;
            let sep_key = right
                .entries
                .first()
                .map(|e| e.key().to_vec())
                .ok_or(DbError::Corrupt("split produced an empty sibling"))?;
            self.store_node(page_id, &node)?;
            self.store_node(right_page, &right)?;
            Ok(Some((sep_key, right_page)))
        }
    }

    /// Remove `key`. If `ghost` is set, leaves a ghost tombstone instead of
    /// physically removing the entry (`spec.md` §4.6 Ghost tombstones, used
    /// under non-`UNSAFE` durability so the lock slot survives until
    /// commit/rollback resolves it). Returns whether an entry was present.
    pub fn delete(&self, key: &[u8], ghost: bool) -> DbResult<bool> {
        let root = self.root();
        let existed = self.existed_at(root, key)?;
        self.delete_recursive(root, key, ghost)?;

        let root_page = self.root();
        let root_node = self.load_node(root_page)?;
        if !root_node.is_leaf() && root_node.entries.len() == 1 {
            if let Entry::Internal { child, .. } = &root_node.entries[0] {
                let only_child = *child;
                self.free_page(root_page);
                *self.root.lock().unwrap() = only_child;
            }
        }
        Ok(existed)
    }

    fn existed_at(&self, page_id: u64, key: &[u8]) -> DbResult<bool> {
        let node = self.load_node(page_id)?;
        if node.is_leaf() {
            Ok(matches!(node.find(key), Ok(i) if !matches!(node.entries[i], Entry::Ghost { .. })))
        } else {
            let child_idx = node.child_index_for(key);
            let child = match &node.entries[child_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            self.existed_at(child, key)
        }
    }

    /// Returns whether `page_id`'s node is now below the low-water mark
    /// (and is not the tree root), signaling the caller one level up that
    /// it should try to merge or rebalance this child.
    fn delete_recursive(&self, page_id: u64, key: &[u8], ghost: bool) -> DbResult<bool> {
        let root_page = self.root();
        let mut node = self.load_node(page_id)?;
        if node.is_leaf() {
            if ghost {
                if node.find(key).is_ok() {
                    node.insert_ghost(key.to_vec());
                }
            } else {
                node.remove(key);
            }
            self.store_node(page_id, &node)?;
        } else {
            let child_idx = node.child_index_for(key);
            let child_page = match &node.entries[child_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            let child_underflowed = self.delete_recursive(child_page, key, ghost)?;
            if child_underflowed {
                self.fix_underflow(&mut node, child_idx)?;
            }
            self.store_node(page_id, &node)?;
        }
        Ok(node.is_below_low_water_mark() && page_id != root_page)
    }

    /// Merge or rebalance the child at `child_idx` of `parent` with a
    /// sibling, since it has fallen below the low-water mark.
    fn fix_underflow(&self, parent: &mut Node, child_idx: usize) -> DbResult<()> {
        let has_right = child_idx + 1 < parent.entries.len();
        let has_left = child_idx > 0;
        if !has_right && !has_left {
            return Ok(());
        }

        if has_right {
            let sibling_idx = child_idx + 1;
            let child_page = match &parent.entries[child_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            let sibling_page = match &parent.entries[sibling_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            let mut child = self.load_node(child_page)?;
            let mut sibling = self.load_node(sibling_page)?;
            if child.try_merge(&mut sibling) {
                self.store_node(child_page, &child)?;
                self.free_page(sibling_page);
                parent.entries.remove(sibling_idx);
            } else {
                child.rebalance_with(&mut sibling);
                let new_sep = sibling
                    .entries
                    .first()
                    .map(|e| e.key().to_vec())
                    .ok_or(DbError::Corrupt("rebalance left a sibling empty"))?;
                self.store_node(child_page, &child)?;
                self.store_node(sibling_page, &sibling)?;
                if let Entry::Internal { key, .. } = &mut parent.entries[sibling_idx] {
                    *key = new_sep;
                }
            }
        } else {
            let sibling_idx = child_idx - 1;
            let sibling_page = match &parent.entries[sibling_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            let child_page = match &parent.entries[child_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            let mut sibling = self.load_node(sibling_page)?;
            let mut child = self.load_node(child_page)?;
            if sibling.try_merge(&mut child) {
                self.store_node(sibling_page, &sibling)?;
                self.free_page(child_page);
                parent.entries.remove(child_idx);
            } else {
                sibling.rebalance_with(&mut child);
                let new_sep = child
                    .entries
                    .first()
                    .map(|e| e.key().to_vec())
                    .ok_or(DbError::Corrupt("rebalance left a sibling empty"))?;
                self.store_node(sibling_page, &sibling)?;
                self.store_node(child_page, &child)?;
                if let Entry::Internal { key, .. } = &mut parent.entries[child_idx] {
                    *key = new_sep;
                }
            }
        }
        Ok(())
    }

    // --- ordered lookup ---------------------------------------------------

    /// Build the root-to-leaf descent path for `key`: at each internal
    /// level, the chosen child index; at the leaf, the `binary_search`
    /// result (exact match index, or insertion point).
    fn descend_path(&self, key: &[u8]) -> DbResult<Vec<(Node, usize)>> {
        let mut path = Vec::new();
        let mut page_id = self.root();
        loop {
            let node = self.load_node(page_id)?;
            if node.is_leaf() {
                let idx = match node.find(key) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                path.push((node, idx));
                return Ok(path);
            }
            let child_idx = node.child_index_for(key);
            let child_page = match &node.entries[child_idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            path.push((node, child_idx));
            page_id = child_page;
        }
    }

    fn leftmost_in_subtree(&self, page_id: u64) -> DbResult<Option<Entry>> {
        let mut path = Vec::new();
        let mut cur = page_id;
        let leaf = loop {
            let node = self.load_node(cur)?;
            if node.is_leaf() {
                break node;
            }
            let child = match &node.entries[0] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            path.push((node, 0usize));
            cur = child;
        };
        for e in leaf.entries.iter() {
            if !matches!(e, Entry::Ghost { .. }) {
                return Ok(Some(e.clone()));
            }
        }
        for (parent, child_idx) in path.into_iter().rev() {
            if child_idx + 1 < parent.entries.len() {
                let sib = match &parent.entries[child_idx + 1] {
                    Entry::Internal { child, .. } => *child,
                    _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
                };
                return self.leftmost_in_subtree(sib);
            }
        }
        Ok(None)
    }

    fn rightmost_in_subtree(&self, page_id: u64) -> DbResult<Option<Entry>> {
        let mut path = Vec::new();
        let mut cur = page_id;
        let leaf = loop {
            let node = self.load_node(cur)?;
            if node.is_leaf() {
                break node;
            }
            let idx = node.entries.len() - 1;
            let child = match &node.entries[idx] {
                Entry::Internal { child, .. } => *child,
                _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
            };
            path.push((node, idx));
            cur = child;
        };
        for e in leaf.entries.iter().rev() {
            if !matches!(e, Entry::Ghost { .. }) {
                return Ok(Some(e.clone()));
            }
        }
        for (parent, child_idx) in path.into_iter().rev() {
            if child_idx > 0 {
                let sib = match &parent.entries[child_idx - 1] {
                    Entry::Internal { child, .. } => *child,
                    _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
                };
                return self.rightmost_in_subtree(sib);
            }
        }
        Ok(None)
    }

    pub fn first(&self) -> DbResult<Option<Entry>> {
        self.leftmost_in_subtree(self.root())
    }

    pub fn last(&self) -> DbResult<Option<Entry>> {
        self.rightmost_in_subtree(self.root())
    }

    /// Exact lookup; returns `None` for an absent key or a ghost tombstone.
    pub fn find(&self, key: &[u8]) -> DbResult<Option<Entry>> {
        let path = self.descend_path(key)?;
        let (leaf, idx) = path.last().unwrap();
        if leaf.find(key).is_ok() && !matches!(leaf.entries[*idx], Entry::Ghost { .. }) {
            Ok(Some(leaf.entries[*idx].clone()))
        } else {
            Ok(None)
        }
    }

    pub fn find_ge(&self, key: &[u8]) -> DbResult<Option<Entry>> {
        let path = self.descend_path(key)?;
        let (leaf, idx) = path.last().unwrap();
        for i in *idx..leaf.entries.len() {
            if !matches!(leaf.entries[i], Entry::Ghost { .. }) {
                return Ok(Some(leaf.entries[i].clone()));
            }
        }
        for (parent, child_idx) in path[..path.len() - 1].iter().rev() {
            if child_idx + 1 < parent.entries.len() {
                let sep = parent.entries[child_idx + 1].key().to_vec();
                return self.find_ge(&sep);
            }
        }
        Ok(None)
    }

    pub fn find_gt(&self, key: &[u8]) -> DbResult<Option<Entry>> {
        let path = self.descend_path(key)?;
        let (leaf, idx) = path.last().unwrap();
        let exact = leaf.find(key).is_ok();
        let start = if exact { *idx + 1 } else { *idx };
        for i in start..leaf.entries.len() {
            if !matches!(leaf.entries[i], Entry::Ghost { .. }) {
                return Ok(Some(leaf.entries[i].clone()));
            }
        }
        for (parent, child_idx) in path[..path.len() - 1].iter().rev() {
            if child_idx + 1 < parent.entries.len() {
                let sep = parent.entries[child_idx + 1].key().to_vec();
                return self.find_ge(&sep);
            }
        }
        Ok(None)
    }

    pub fn find_le(&self, key: &[u8]) -> DbResult<Option<Entry>> {
        let path = self.descend_path(key)?;
        let (leaf, idx) = path.last().unwrap();
        let exact = leaf.find(key).is_ok();
        let mut i = if exact { *idx + 1 } else { *idx };
        while i > 0 {
            i -= 1;
            if !matches!(leaf.entries[i], Entry::Ghost { .. }) {
                return Ok(Some(leaf.entries[i].clone()));
            }
        }
        for (parent, child_idx) in path[..path.len() - 1].iter().rev() {
            if *child_idx > 0 {
                let sib = match &parent.entries[child_idx - 1] {
                    Entry::Internal { child, .. } => *child,
                    _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
                };
                return self.rightmost_in_subtree(sib);
            }
        }
        Ok(None)
    }

    pub fn find_lt(&self, key: &[u8]) -> DbResult<Option<Entry>> {
        let path = self.descend_path(key)?;
        let (leaf, idx) = path.last().unwrap();
        let mut i = *idx;
        while i > 0 {
            i -= 1;
            if !matches!(leaf.entries[i], Entry::Ghost { .. }) {
                return Ok(Some(leaf.entries[i].clone()));
            }
        }
        for (parent, child_idx) in path[..path.len() - 1].iter().rev() {
            if *child_idx > 0 {
                let sib = match &parent.entries[child_idx - 1] {
                    Entry::Internal { child, .. } => *child,
                    _ => return Err(DbError::Corrupt("internal node held a non-internal entry")),
                };
                return self.rightmost_in_subtree(sib);
            }
        }
        Ok(None)
    }
}

/// An ordered, repositionable view over a [`BTree`] (`spec.md` §4.6 cursor
/// contract).
pub struct Cursor {
    tree: Arc<BTree>,
    key: Option<Vec<u8>>,
}

impl Cursor {
    pub fn new(tree: Arc<BTree>) -> Self {
        Self { tree, key: None }
    }

    pub fn reset(&mut self) {
        self.key = None;
    }

    pub fn copy(&self) -> Cursor {
        Cursor {
            tree: self.tree.clone(),
            key: self.key.clone(),
        }
    }

    fn reposition(&mut self, entry: Option<Entry>) -> DbResult<bool> {
        match entry {
            Some(e) => {
                self.key = Some(e.key().to_vec());
                Ok(true)
            }
            None => {
                self.key = None;
                Ok(false)
            }
        }
    }

    pub fn first(&mut self) -> DbResult<bool> {
        let e = self.tree.first()?;
        self.reposition(e)
    }

    pub fn last(&mut self) -> DbResult<bool> {
        let e = self.tree.last()?;
        self.reposition(e)
    }

    /// Position at `key` exactly; `exists()` afterward reflects whether it
    /// was actually present.
    pub fn find(&mut self, key: &[u8]) -> DbResult<bool> {
        self.key = Some(key.to_vec());
        Ok(self.tree.find(key)?.is_some())
    }

    /// Alias for [`Cursor::find`]: in a path-caching cursor this would reuse
    /// the current position as a descent hint, but since this cursor always
    /// re-descends from the root there is no locality to exploit.
    pub fn find_nearby(&mut self, key: &[u8]) -> DbResult<bool> {
        self.find(key)
    }

    pub fn find_ge(&mut self, key: &[u8]) -> DbResult<bool> {
        let e = self.tree.find_ge(key)?;
        self.reposition(e)
    }

    pub fn find_gt(&mut self, key: &[u8]) -> DbResult<bool> {
        let e = self.tree.find_gt(key)?;
        self.reposition(e)
    }

    pub fn find_le(&mut self, key: &[u8]) -> DbResult<bool> {
        let e = self.tree.find_le(key)?;
        self.reposition(e)
    }

    pub fn find_lt(&mut self, key: &[u8]) -> DbResult<bool> {
        let e = self.tree.find_lt(key)?;
        self.reposition(e)
    }

    /// Reposition to `key` without distinguishing exact/nearby semantics
    /// (`spec.md` §4.6 cursor `move`).
    pub fn move_to(&mut self, key: &[u8]) -> DbResult<bool> {
        self.find(key)
    }

    pub fn next(&mut self) -> DbResult<bool> {
        let e = match &self.key {
            Some(k) => self.tree.find_gt(k)?,
            None => self.tree.first()?,
        };
        self.reposition(e)
    }

    pub fn previous(&mut self) -> DbResult<bool> {
        let e = match &self.key {
            Some(k) => self.tree.find_lt(k)?,
            None => self.tree.last()?,
        };
        self.reposition(e)
    }

    /// Step forward (positive) or backward (negative) `n` positions.
    pub fn skip(&mut self, n: i64) -> DbResult<bool> {
        let mut ok = true;
        if n >= 0 {
            for _ in 0..n {
                ok = self.next()?;
                if !ok {
                    break;
                }
            }
        } else {
            for _ in 0..(-n) {
                ok = self.previous()?;
                if !ok {
                    break;
                }
            }
        }
        Ok(ok)
    }

    pub fn exists(&self) -> DbResult<bool> {
        match &self.key {
            Some(k) => Ok(self.tree.find(k)?.is_some()),
            None => Ok(false),
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Load the full value at the current position, materializing any
    /// fragmented representation.
    pub fn load(&self) -> DbResult<Option<Vec<u8>>> {
        let Some(key) = &self.key else { return Ok(None) };
        match self.tree.find(key)? {
            Some(Entry::Leaf { value, .. }) => {
                let len = value.total_len() as usize;
                let bytes = fragment::read_value(
                    &value,
                    0,
                    len,
                    self.tree.page_size(),
                    self.tree.array().as_ref(),
                )?;
                Ok(Some(bytes))
            }
            _ => Ok(None),
        }
    }

    /// Store `value` at the current position, recording an undo record so
    /// the write can be rolled back.
    pub fn store(&mut self, value: Vec<u8>, undo: &mut UndoLog) -> DbResult<()> {
        let key = self.key.clone().ok_or(DbError::InvalidTransaction)?;
        let previous = self.tree.find(&key)?;
        let repr = if value.len() <= fragment::inline_threshold(self.tree.page_size()) {
            ValueRepr::Inline(value)
        } else {
            fragment::fragment_value(
                &value,
                self.tree.page_size(),
                self.tree.allocator(),
                self.tree.array().as_ref(),
            )?
        };
        match previous {
            Some(Entry::Leaf { value: old, .. }) => undo.push(UndoRecord::UnUpdate {
                index_id: self.tree.index_id(),
                key: key.clone(),
                old_value: old,
            }),
            _ => undo.push(UndoRecord::UnInsert {
                index_id: self.tree.index_id(),
                key: key.clone(),
            }),
        }
        self.tree.insert(&key, repr)
    }

    /// Delete the entry at the current position. `ghost` controls whether a
    /// tombstone is left (non-`UNSAFE` durability) or the entry is removed
    /// outright.
    pub fn delete(&mut self, ghost: bool, undo: &mut UndoLog) -> DbResult<bool> {
        let key = self.key.clone().ok_or(DbError::InvalidTransaction)?;
        let previous = self.tree.find(&key)?;
        if let Some(Entry::Leaf { value: old, .. }) = previous {
            let index_id = self.tree.index_id();
            let record = if old.is_fragmented() {
                UndoRecord::UnDeleteFragmented {
                    index_id,
                    key: key.clone(),
                    old_value: old,
                }
            } else {
                UndoRecord::UnDelete {
                    index_id,
                    key: key.clone(),
                    old_value: old,
                }
            };
            undo.push(record);
        }
        self.tree.delete(&key, ghost)
    }

    pub fn value_length(&self) -> DbResult<Option<u64>> {
        let Some(key) = &self.key else { return Ok(None) };
        match self.tree.find(key)? {
            Some(Entry::Leaf { value, .. }) => Ok(Some(value.total_len())),
            _ => Ok(None),
        }
    }

    pub fn value_read(&self, pos: u64, len: usize) -> DbResult<Vec<u8>> {
        let Some(key) = &self.key else { return Ok(Vec::new()) };
        match self.tree.find(key)? {
            Some(Entry::Leaf { value, .. }) => fragment::read_value(
                &value,
                pos,
                len,
                self.tree.page_size(),
                self.tree.array().as_ref(),
            ),
            _ => Ok(Vec::new()),
        }
    }

    pub fn value_write(&mut self, pos: u64, buf: &[u8], undo: &mut UndoLog) -> DbResult<()> {
        let key = self.key.clone().ok_or(DbError::InvalidTransaction)?;
        let current = match self.tree.find(&key)? {
            Some(Entry::Leaf { value, .. }) => value,
            _ => ValueRepr::Inline(Vec::new()),
        };
        let new_repr = fragment::write_value(
            current,
            pos,
            buf,
            self.tree.page_size(),
            self.tree.allocator(),
            self.tree.array().as_ref(),
            undo,
            self.tree.index_id(),
            &key,
        )?;
        self.tree.insert(&key, new_repr)
    }

    pub fn value_set_length(&mut self, new_len: u64, undo: &mut UndoLog) -> DbResult<()> {
        let key = self.key.clone().ok_or(DbError::InvalidTransaction)?;
        let current = match self.tree.find(&key)? {
            Some(Entry::Leaf { value, .. }) => value,
            _ => ValueRepr::Inline(Vec::new()),
        };
        let new_repr = fragment::set_value_length(
            current,
            new_len,
            self.tree.page_size(),
            self.tree.allocator(),
            self.tree.array().as_ref(),
            undo,
            self.tree.index_id(),
            &key,
        )?;
        self.tree.insert(&key, new_repr)
    }

    pub fn value_clear(&mut self, undo: &mut UndoLog) -> DbResult<()> {
        self.value_set_length(0, undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_array::MemPageArray;

    fn new_tree(page_size: usize) -> Arc<BTree> {
        let array: Arc<dyn PageArray> = Arc::new(MemPageArray::new(page_size));
        let alloc = Arc::new(PageAllocator::new(0));
        let cache = Arc::new(NodeCache::new(64));
        Arc::new(BTree::open(array, alloc, cache, page_size, None, DEFAULT_INDEX_ID).unwrap())
    }

    #[test]
    fn insert_and_find_round_trips() {
        let tree = new_tree(256);
        tree.insert(b"a", ValueRepr::Inline(b"1".to_vec())).unwrap();
        tree.insert(b"b", ValueRepr::Inline(b"2".to_vec())).unwrap();
        match tree.find(b"a").unwrap() {
            Some(Entry::Leaf { value, .. }) => assert_eq!(value, ValueRepr::Inline(b"1".to_vec())),
            _ => panic!("missing"),
        }
    }

    #[test]
    fn many_inserts_force_splits_and_stay_ordered() {
        let tree = new_tree(256);
        for i in 0..200u32 {
            let k = format!("key{:05}", i).into_bytes();
            tree.insert(&k, ValueRepr::Inline(vec![0u8; 20])).unwrap();
        }
        let mut cursor = Cursor::new(tree.clone());
        cursor.first().unwrap();
        let mut count = 0;
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let k = cursor.key().unwrap().to_vec();
            if let Some(last) = &last_key {
                assert!(last < &k);
            }
            last_key = Some(k);
            count += 1;
            if !cursor.next().unwrap() {
                break;
            }
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn delete_then_inserts_reuses_space_and_merges() {
        let tree = new_tree(256);
        for i in 0..100u32 {
            let k = format!("key{:05}", i).into_bytes();
            tree.insert(&k, ValueRepr::Inline(vec![0u8; 20])).unwrap();
        }
        for i in 0..90u32 {
            let k = format!("key{:05}", i).into_bytes();
            assert!(tree.delete(&k, false).unwrap());
        }
        let mut cursor = Cursor::new(tree);
        cursor.first().unwrap();
        let mut count = 0;
        loop {
            count += 1;
            if !cursor.next().unwrap() {
                break;
            }
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn ghost_delete_hides_value_but_cursor_skips_it() {
        let tree = new_tree(256);
        tree.insert(b"a", ValueRepr::Inline(b"1".to_vec())).unwrap();
        tree.insert(b"b", ValueRepr::Inline(b"2".to_vec())).unwrap();
        tree.delete(b"a", true).unwrap();
        assert!(tree.find(b"a").unwrap().is_none());
        let mut cursor = Cursor::new(tree);
        cursor.first().unwrap();
        assert_eq!(cursor.key(), Some(&b"b"[..]));
    }

    #[test]
    fn cursor_store_and_load_round_trips_with_undo() {
        let tree = new_tree(256);
        let mut cursor = Cursor::new(tree);
        let mut undo = UndoLog::new(1);
        cursor.find(b"k").unwrap();
        cursor.store(b"hello".to_vec(), &mut undo).unwrap();
        assert_eq!(cursor.load().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(undo.len(), 1);
    }

    #[test]
    fn large_value_round_trips_through_fragmentation() {
        let tree = new_tree(128);
        let mut cursor = Cursor::new(tree);
        let mut undo = UndoLog::new(1);
        cursor.find(b"big").unwrap();
        let big = vec![5u8; 5000];
        cursor.store(big.clone(), &mut undo).unwrap();
        assert_eq!(cursor.load().unwrap(), Some(big));
    }
}
