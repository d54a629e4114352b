//! Page allocator / free list (C2, `spec.md` §4.2).
//!
//! Manages a persistent free list of fixed-size pages. A page freed during a
//! transaction that has not yet checkpointed must remain unreachable from
//! the durable tree until the next successful sync of the new root — this is
//! implemented by keeping two pools: `free` (safe to hand out right now) and
//! `pending` (freed at some generation, promoted to `free` only once a
//! checkpoint whose snapshot generation is newer than the free has
//! committed).

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{DbError, DbResult};
use crate::page_array::PageArray;

pub struct Alloc {
    pub page: u64,
}

struct PendingFree {
    generation: u64,
    page: u64,
}

struct Inner {
    /// Pages available for immediate reuse.
    free: BTreeSet<u64>,
    /// Pages freed by an in-progress transaction, not yet safe to reuse.
    pending: Vec<PendingFree>,
    /// One past the highest page id ever handed out.
    next_page: u64,
    /// Monotonic generation counter, bumped once per checkpoint.
    generation: u64,
}

/// A persistent page allocator / free list (`spec.md` §4.2).
pub struct PageAllocator {
    reserved_below: u64,
    inner: Mutex<Inner>,
    allocated_count: AtomicU64,
}

impl PageAllocator {
    /// `reserved_below` pages (e.g. the double-buffered header) are never
    /// handed out by this allocator.
    pub fn new(reserved_below: u64) -> Self {
        Self {
            reserved_below,
            inner: Mutex::new(Inner {
                free: BTreeSet::new(),
                pending: Vec::new(),
                next_page: reserved_below,
                generation: 0,
            }),
            allocated_count: AtomicU64::new(0),
        }
    }

    /// Allocate a single new page id, copy-on-write style: always a page no
    /// reader or snapshot can already be observing.
    pub fn alloc(&self) -> DbResult<Alloc> {
        let mut inner = self.inner.lock().unwrap();
        let page = if let Some(&p) = inner.free.iter().next() {
            inner.free.remove(&p);
            p
        } else {
            let p = inner.next_page;
            inner.next_page += 1;
            p
        };
        self.allocated_count.fetch_add(1, Ordering::Relaxed);
        Ok(Alloc { page })
    }

    /// Mark `page` as freed as of the allocator's current generation. It
    /// will not be reused until `advance_generation` has moved the
    /// generation past this point and the result has been durably
    /// checkpointed.
    pub fn free(&self, page: u64) {
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.generation;
        inner.pending.push(PendingFree { generation, page });
    }

    /// Ensure at least `n` additional pages are available without
    /// necessarily returning specific ids (used to presize a bulk
    /// operation); for this allocator design, reservation is equivalent to
    /// bumping the high-water mark, since ids are not handed out until
    /// `alloc` is actually called.
    pub fn reserve(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        if (inner.free.len() as u64) < n {
            let shortfall = n - inner.free.len() as u64;
            inner.next_page += shortfall;
        }
    }

    /// Advance the allocator's generation (called once a checkpoint's new
    /// root has durably synced) and fold in any pending-free pages whose
    /// generation predates it, since no in-progress reader or snapshot
    /// opened before the new root can observe them any longer.
    pub fn advance_generation(&self, oldest_active_generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        let (ready, still_pending): (Vec<_>, Vec<_>) = inner
            .pending
            .drain(..)
            .partition(|p| p.generation < oldest_active_generation);
        for p in &ready {
            inner.free.insert(p.page);
        }
        inner.pending = still_pending;
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Persist the free list to pages in `array`, starting at `root_page`,
    /// returning the root page of the serialized chain. Each page holds a
    /// little-endian `u32` entry count followed by that many `u64` page ids,
    /// plus a trailing `u64` "next page" pointer (0 = end of chain).
    pub fn commit_allocator(&self, array: &dyn PageArray, start_page: u64) -> DbResult<u64> {
        let inner = self.inner.lock().unwrap();
        let page_size = array.page_size();
        let ids: Vec<u64> = inner.free.iter().copied().collect();
        drop(inner);

        if ids.is_empty() {
            return Ok(0);
        }

        let entries_per_page = (page_size - 4 - 8) / 8;
        let chunks: Vec<&[u64]> = ids.chunks(entries_per_page).collect();
        let mut page_ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            page_ids.push(self.alloc()?.page);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let mut buf = vec![0u8; page_size];
            let next = if i + 1 < page_ids.len() {
                page_ids[i + 1]
            } else {
                0
            };
            {
                let mut w = Cursor::new(&mut buf[..]);
                w.write_u32::<LittleEndian>(chunk.len() as u32).unwrap();
                for id in chunk.iter() {
                    w.write_u64::<LittleEndian>(*id).unwrap();
                }
                w.set_position((page_size - 8) as u64);
                w.write_u64::<LittleEndian>(next).unwrap();
            }
            array.write_page(page_ids[i], &buf)?;
        }
        let _ = start_page;
        Ok(page_ids[0])
    }

    /// Load a previously persisted free list chain back into memory.
    pub fn load_allocator(
        array: &dyn PageArray,
        root_page: u64,
        reserved_below: u64,
        next_page: u64,
    ) -> DbResult<Self> {
        let alloc = Self::new(reserved_below);
        {
            let mut inner = alloc.inner.lock().unwrap();
            inner.next_page = next_page;
        }
        if root_page == 0 {
            return Ok(alloc);
        }
        let page_size = array.page_size();
        let mut page = root_page;
        loop {
            let mut buf = vec![0u8; page_size];
            array.read_page(page, &mut buf)?;
            let mut r = Cursor::new(&buf[..]);
            let count = r
                .read_u32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("truncated free list page"))?;
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ids.push(
                    r.read_u64::<LittleEndian>()
                        .map_err(|_| DbError::Corrupt("truncated free list entry"))?,
                );
            }
            {
                let mut inner = alloc.inner.lock().unwrap();
                for id in ids {
                    inner.free.insert(id);
                }
            }
            let mut tail = Cursor::new(&buf[page_size - 8..]);
            let next = tail
                .read_u64::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("truncated free list tail pointer"))?;
            if next == 0 {
                break;
            }
            page = next;
        }
        Ok(alloc)
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated_count.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_array::MemPageArray;

    #[test]
    fn alloc_bumps_high_water_mark() {
        let a = PageAllocator::new(2);
        assert_eq!(a.alloc().unwrap().page, 2);
        assert_eq!(a.alloc().unwrap().page, 3);
    }

    #[test]
    fn freed_page_not_reused_until_generation_advances() {
        let a = PageAllocator::new(0);
        let p = a.alloc().unwrap().page;
        a.free(p);
        // Not yet reusable: generation hasn't advanced past the free's mark.
        let next = a.alloc().unwrap().page;
        assert_ne!(next, p);
        a.advance_generation(u64::MAX);
        let reused = a.alloc().unwrap().page;
        assert_eq!(reused, p);
    }

    #[test]
    fn free_list_round_trips_through_pages() {
        let array = MemPageArray::new(64);
        let a = PageAllocator::new(1);
        for _ in 0..5 {
            let p = a.alloc().unwrap().page;
            a.free(p);
        }
        a.advance_generation(u64::MAX);
        assert_eq!(a.free_count(), 5);

        let root = a.commit_allocator(&array, 0).unwrap();
        assert_ne!(root, 0);

        let next_page = {
            // next_page tracked separately in this simplified header model
            6
        };
        let loaded = PageAllocator::load_allocator(&array, root, 1, next_page).unwrap();
        assert_eq!(loaded.free_count(), 5);
    }
}
