//! Node cache (C3, `spec.md` §4.3).
//!
//! A fixed-capacity bounded pool of decoded B-tree nodes. Per the Design
//! Notes redesign item, the teacher's pointer-heavy least-used/most-used
//! linked structures are replaced with an arena of slots indexed by `u32`;
//! `prev`/`next` are slot indices rather than pointers, so there is no
//! aliasing to reason about.

use std::sync::Mutex;

use crate::error::{DbError, DbResult};
use crate::latch::Latch;
use crate::tree::node::Node;

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvictMode {
    /// The slot may be evicted to make room for another node.
    Evictable,
    /// The slot must not be evicted (e.g. pinned by an active cursor).
    Unevictable,
    /// Do not evict anything to satisfy this allocation; fail instead.
    NoEvict,
}

struct Slot {
    node: Option<Node>,
    page_id: u64,
    prev: u32,
    next: u32,
    mode: EvictMode,
    latch: Latch,
    dirty: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            node: None,
            page_id: 0,
            prev: NIL,
            next: NIL,
            mode: EvictMode::Evictable,
            latch: Latch::new(),
            dirty: false,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    /// Least-recently-used end of the intrusive list.
    lru_head: u32,
    /// Most-recently-used end.
    lru_tail: u32,
    free_slots: Vec<u32>,
    by_page: std::collections::HashMap<u64, u32>,
}

/// A bounded pool of decoded nodes, ordered least- to most-recently used.
pub struct NodeCache {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl NodeCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                lru_head: NIL,
                lru_tail: NIL,
                free_slots: Vec::new(),
                by_page: std::collections::HashMap::new(),
            }),
        }
    }

    fn unlink(inner: &mut Inner, slot: u32) {
        let (prev, next) = (inner.slots[slot as usize].prev, inner.slots[slot as usize].next);
        if prev != NIL {
            inner.slots[prev as usize].next = next;
        } else {
            inner.lru_head = next;
        }
        if next != NIL {
            inner.slots[next as usize].prev = prev;
        } else {
            inner.lru_tail = prev;
        }
        inner.slots[slot as usize].prev = NIL;
        inner.slots[slot as usize].next = NIL;
    }

    fn push_mru(inner: &mut Inner, slot: u32) {
        let old_tail = inner.lru_tail;
        inner.slots[slot as usize].prev = old_tail;
        inner.slots[slot as usize].next = NIL;
        if old_tail != NIL {
            inner.slots[old_tail as usize].next = slot;
        } else {
            inner.lru_head = slot;
        }
        inner.lru_tail = slot;
    }

    /// Look up a cached node by page id, moving it to the MRU end on a hit.
    /// Per `spec.md` §4.3, this is best-effort: if the queue latch is
    /// contended, the move is skipped rather than blocked on.
    pub fn lookup(&self, page_id: u64) -> Option<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.by_page.get(&page_id) {
            Self::unlink(&mut inner, slot);
            Self::push_mru(&mut inner, slot);
            Some(())
        } else {
            None
        }
    }

    pub fn contains(&self, page_id: u64) -> bool {
        self.inner.lock().unwrap().by_page.contains_key(&page_id)
    }

    /// Attempt to allocate a slot for `page_id`, possibly evicting the
    /// least-recently-used entry. `flush` is invoked with the evicted node
    /// and its page id if an eviction is required.
    pub fn try_alloc_latched<F>(
        &self,
        page_id: u64,
        mode: EvictMode,
        mut flush: F,
    ) -> DbResult<u32>
    where
        F: FnMut(u64, &Node) -> DbResult<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.by_page.get(&page_id) {
            return Ok(slot);
        }

        if inner.slots.len() < self.max_size || !inner.free_slots.is_empty() {
            let slot = if let Some(s) = inner.free_slots.pop() {
                s
            } else {
                inner.slots.push(Slot::empty());
                (inner.slots.len() - 1) as u32
            };
            inner.slots[slot as usize].page_id = page_id;
            inner.slots[slot as usize].mode = mode;
            inner.by_page.insert(page_id, slot);
            Self::push_mru(&mut inner, slot);
            return Ok(slot);
        }

        // Pool is full: evict starting from the LRU end.
        let mut cursor = inner.lru_head;
        while cursor != NIL {
            let candidate = cursor;
            cursor = inner.slots[candidate as usize].next;
            if inner.slots[candidate as usize].mode != EvictMode::Evictable {
                continue;
            }
            if inner.slots[candidate as usize].dirty {
                if mode == EvictMode::NoEvict {
                    return Err(DbError::Corrupt("node cache exhausted: no evictable slot"));
                }
                let old_page = inner.slots[candidate as usize].page_id;
                let node = inner.slots[candidate as usize]
                    .node
                    .clone()
                    .ok_or(DbError::Corrupt("dirty slot missing its node"))?;
                // Hold this slot's latch across the flush so it cannot be
                // reused concurrently while mid-eviction.
                inner.slots[candidate as usize].latch.acquire_exclusive();
                let flush_result = flush(old_page, &node);
                inner.slots[candidate as usize].latch.release_exclusive();
                if let Err(e) = flush_result {
                    // Eviction faulted: leave the slot at the MRU end so a
                    // retry doesn't immediately re-select it.
                    Self::unlink(&mut inner, candidate);
                    Self::push_mru(&mut inner, candidate);
                    return Err(e);
                }
            }
            let old_page = inner.slots[candidate as usize].page_id;
            inner.by_page.remove(&old_page);
            Self::unlink(&mut inner, candidate);
            inner.slots[candidate as usize].node = None;
            inner.slots[candidate as usize].dirty = false;
            inner.slots[candidate as usize].page_id = page_id;
            inner.slots[candidate as usize].mode = mode;
            inner.by_page.insert(page_id, candidate);
            Self::push_mru(&mut inner, candidate);
            return Ok(candidate);
        }
        Err(DbError::Corrupt("node cache exhausted: no evictable slot"))
    }

    pub fn set_node(&self, slot: u32, node: Node, dirty: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots[slot as usize].node = Some(node);
        inner.slots[slot as usize].dirty = dirty;
    }

    pub fn get_node(&self, slot: u32) -> Option<Node> {
        self.inner.lock().unwrap().slots[slot as usize].node.clone()
    }

    /// Convenience lookup used by the tree layer: fetch a node by page id,
    /// bumping it to the MRU end on a hit.
    pub fn get_by_page(&self, page_id: u64) -> Option<Node> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.by_page.get(&page_id) {
            Self::unlink(&mut inner, slot);
            Self::push_mru(&mut inner, slot);
            inner.slots[slot as usize].node.clone()
        } else {
            None
        }
    }

    /// Convenience insert used by the tree layer: allocate a slot for
    /// `page_id` (possibly evicting, via `flush`) and install `node` into it.
    pub fn put<F>(&self, page_id: u64, node: Node, dirty: bool, flush: F) -> DbResult<()>
    where
        F: FnMut(u64, &Node) -> DbResult<()>,
    {
        let slot = self.try_alloc_latched(page_id, EvictMode::Evictable, flush)?;
        self.set_node(slot, node, dirty);
        Ok(())
    }

    pub fn mark_dirty_by_page(&self, page_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.by_page.get(&page_id) {
            inner.slots[slot as usize].dirty = true;
        }
    }

    pub fn invalidate(&self, page_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.by_page.remove(&page_id) {
            Self::unlink(&mut inner, slot);
            inner.slots[slot as usize].node = None;
            inner.slots[slot as usize].dirty = false;
            inner.free_slots.push(slot);
        }
    }

    /// Write out every dirty node via `flush`, clearing their dirty bits.
    /// Used by the checkpointer (`spec.md` §4.10), which needs every
    /// modified page durable before it can advance the header.
    pub fn flush_all<F>(&self, mut flush: F) -> DbResult<()>
    where
        F: FnMut(u64, &Node) -> DbResult<()>,
    {
        let dirty: Vec<(u32, u64, Node)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.dirty && s.node.is_some())
                .map(|(i, s)| (i as u32, s.page_id, s.node.clone().unwrap()))
                .collect()
        };
        for (slot, page_id, node) in dirty {
            flush(page_id, &node)?;
            let mut inner = self.inner.lock().unwrap();
            inner.slots[slot as usize].dirty = false;
        }
        Ok(())
    }

    pub fn mark_dirty(&self, slot: u32) {
        self.inner.lock().unwrap().slots[slot as usize].dirty = true;
    }

    /// Mark a slot as evictable again, the inverse of pinning it
    /// unevictable.
    pub fn make_evictable(&self, slot: u32) {
        self.inner.lock().unwrap().slots[slot as usize].mode = EvictMode::Evictable;
    }

    pub fn make_unevictable(&self, slot: u32) {
        self.inner.lock().unwrap().slots[slot as usize].mode = EvictMode::Unevictable;
    }

    /// Mark `slot` used: best-effort MRU bump via a non-blocking latch.
    pub fn used(&self, slot: u32) {
        if let Ok(mut inner) = self.inner.try_lock() {
            Self::unlink(&mut inner, slot);
            Self::push_mru(&mut inner, slot);
        }
        // Contended: skip the move, per spec "best effort" contract.
    }

    pub fn unused(&self, slot: u32) {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink(&mut inner, slot);
        inner.lru_head = if inner.lru_head == NIL { slot } else { inner.lru_head };
        // Push to LRU (least-used) end instead of MRU.
        let old_head = inner.lru_head;
        inner.slots[slot as usize].next = old_head;
        inner.slots[slot as usize].prev = NIL;
        if old_head != NIL && old_head != slot {
            inner.slots[old_head as usize].prev = slot;
        }
        inner.lru_head = slot;
        if inner.lru_tail == NIL {
            inner.lru_tail = slot;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_page.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::Node;

    #[test]
    fn alloc_evicts_lru_when_full() {
        let cache = NodeCache::new(2);
        let mut flushed = Vec::new();
        let s0 = cache
            .try_alloc_latched(1, EvictMode::Evictable, |_, _| Ok(()))
            .unwrap();
        cache.set_node(s0, Node::new_leaf(4096), true);
        let s1 = cache
            .try_alloc_latched(2, EvictMode::Evictable, |_, _| Ok(()))
            .unwrap();
        cache.set_node(s1, Node::new_leaf(4096), true);
        // touch page 1 so it becomes MRU, leaving page 2 as LRU
        cache.used(s0);

        let _s2 = cache
            .try_alloc_latched(3, EvictMode::Evictable, |page, _| {
                flushed.push(page);
                Ok(())
            })
            .unwrap();
        assert_eq!(flushed, vec![2]);
        assert!(!cache.contains(2));
        assert!(cache.contains(1));
        assert!(cache.contains(3));
    }

    #[test]
    fn no_evict_fails_when_all_dirty_and_full() {
        let cache = NodeCache::new(1);
        let s0 = cache
            .try_alloc_latched(1, EvictMode::Evictable, |_, _| Ok(()))
            .unwrap();
        cache.set_node(s0, Node::new_leaf(4096), true);
        let res = cache.try_alloc_latched(2, EvictMode::NoEvict, |_, _| Ok(()));
        assert!(res.is_err());
    }
}
