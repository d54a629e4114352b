//! Checkpointer (C10, `spec.md` §4.10).
//!
//! Periodically (by rate or by redo-log size threshold) makes the current
//! tree state durable and truncates the redo log, following a fixed
//! crash-atomic sequence: flush dirty nodes, persist the allocator's free
//! list, write the new root into the *inactive* half of a double-buffered
//! header, sync, flip the active half, sync again, then truncate the redo
//! log. A crash at any point before the header flip leaves the previous
//! checkpoint fully intact; a crash after leaves the new one intact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::alloc::PageAllocator;
use crate::cache::NodeCache;
use crate::error::DbResult;
use crate::listener::{CheckpointPhase, EventListener};
use crate::page_array::PageArray;
use crate::redo::RedoLog;
use crate::tree::node::Node;

/// The two-slot durable header, one page each, written alternately so a
/// crash mid-write never corrupts the slot recovery falls back to
/// (`spec.md` §4.10, §4.11).
pub struct Header {
    array: Arc<dyn PageArray>,
    slot_pages: [u64; 2],
}

/// Fixed content of one header slot.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSlot {
    pub generation: u64,
    pub root_page: u64,
    pub allocator_root: u64,
    pub allocator_next_page: u64,
    pub checksum: u32,
}

const HEADER_SLOT_LEN: usize = 8 + 8 + 8 + 8 + 4;

impl HeaderSlot {
    fn encode(&self) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};
        let mut buf = Vec::with_capacity(HEADER_SLOT_LEN);
        buf.write_u64::<LittleEndian>(self.generation).unwrap();
        buf.write_u64::<LittleEndian>(self.root_page).unwrap();
        buf.write_u64::<LittleEndian>(self.allocator_root).unwrap();
        buf.write_u64::<LittleEndian>(self.allocator_next_page).unwrap();
        let checksum = crc32c::crc32c(&buf);
        buf.write_u32::<LittleEndian>(checksum).unwrap();
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        use byteorder::{LittleEndian, ReadBytesExt};
        if buf.len() < HEADER_SLOT_LEN {
            return None;
        }
        let mut r = std::io::Cursor::new(buf);
        let generation = r.read_u64::<LittleEndian>().ok()?;
        let root_page = r.read_u64::<LittleEndian>().ok()?;
        let allocator_root = r.read_u64::<LittleEndian>().ok()?;
        let allocator_next_page = r.read_u64::<LittleEndian>().ok()?;
        let content_len = r.position() as usize;
        let checksum = r.read_u32::<LittleEndian>().ok()?;
        if crc32c::crc32c(&buf[..content_len]) != checksum {
            return None;
        }
        Some(Self {
            generation,
            root_page,
            allocator_root,
            allocator_next_page,
            checksum,
        })
    }
}

impl Header {
    pub fn new(array: Arc<dyn PageArray>, slot_pages: [u64; 2]) -> Self {
        Self { array, slot_pages }
    }

    /// Read both slots and return the one with the higher valid generation
    /// (`spec.md` §4.11 step 1).
    pub fn read_latest(&self) -> DbResult<Option<HeaderSlot>> {
        let page_size = self.array.page_size();
        let mut best: Option<HeaderSlot> = None;
        for &page in &self.slot_pages {
            let mut buf = vec![0u8; page_size];
            if self.array.read_page(page, &mut buf).is_err() {
                continue;
            }
            if let Some(slot) = HeaderSlot::decode(&buf) {
                if best.map(|b| slot.generation > b.generation).unwrap_or(true) {
                    best = Some(slot);
                }
            }
        }
        Ok(best)
    }

    fn write_slot(&self, which: usize, slot: &HeaderSlot) -> DbResult<()> {
        let mut buf = slot.encode();
        buf.resize(self.array.page_size(), 0);
        self.array.write_page(self.slot_pages[which], &buf)
    }
}

/// Drives the checkpoint sequence (`spec.md` §4.10).
pub struct Checkpointer {
    header: Header,
    generation: AtomicU64,
    active_slot: AtomicU64,
}

impl Checkpointer {
    pub fn new(header: Header, starting_generation: u64, starting_slot: usize) -> Self {
        Self {
            header,
            generation: AtomicU64::new(starting_generation),
            active_slot: AtomicU64::new(starting_slot as u64),
        }
    }

    /// Run one full checkpoint. `root_page` is the tree's current root;
    /// `alloc` the page allocator whose free list must also be made
    /// durable alongside it.
    pub fn run(
        &self,
        cache: &NodeCache,
        array: &dyn PageArray,
        alloc: &PageAllocator,
        redo: &RedoLog,
        root_page: u64,
        listener: &dyn EventListener,
    ) -> DbResult<()> {
        log::debug!("checkpoint starting at generation {}", self.generation.load(Ordering::SeqCst));
        listener.checkpoint(CheckpointPhase::Begin);

        // Step 1: flush every dirty node to its page.
        cache.flush_all(|page_id, node: &Node| array.write_page(page_id, &node.encode()))?;
        listener.checkpoint(CheckpointPhase::FlushDirtyPages);

        // Step 2: persist the free list.
        let allocator_root = alloc.commit_allocator(array, 0)?;

        // Step 3: sync data pages before the header can reference them.
        array.sync(false)?;

        // Step 4: write the new header into the currently inactive slot.
        let next_slot = 1 - (self.active_slot.load(Ordering::SeqCst) as usize);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = HeaderSlot {
            generation,
            root_page,
            allocator_root,
            allocator_next_page: 0,
            checksum: 0,
        };
        self.header.write_slot(next_slot, &slot)?;

        // Step 5: sync the header write itself.
        array.sync(true)?;
        listener.checkpoint(CheckpointPhase::HeaderSynced);

        // Step 6: flip to the new slot, making it the one recovery trusts.
        self.active_slot.store(next_slot as u64, Ordering::SeqCst);

        // Step 7: the redo log entries up through this point are now
        // redundant with the durable tree; truncate.
        redo.truncate()?;
        listener.checkpoint(CheckpointPhase::RedoTruncated);
        log::debug!("checkpoint complete, new generation {}", generation);

        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_array::MemPageArray;
    use std::sync::Arc;

    #[test]
    fn header_slot_round_trips() {
        let slot = HeaderSlot {
            generation: 7,
            root_page: 12,
            allocator_root: 3,
            allocator_next_page: 99,
            checksum: 0,
        };
        let buf = slot.encode();
        let decoded = HeaderSlot::decode(&buf).unwrap();
        assert_eq!(decoded.generation, 7);
        assert_eq!(decoded.root_page, 12);
    }

    #[test]
    fn corrupt_slot_is_rejected() {
        let slot = HeaderSlot {
            generation: 1,
            root_page: 1,
            allocator_root: 0,
            allocator_next_page: 0,
            checksum: 0,
        };
        let mut buf = slot.encode();
        buf[0] ^= 0xFF;
        assert!(HeaderSlot::decode(&buf).is_none());
    }

    #[test]
    fn checkpoint_writes_recoverable_header() {
        let array: Arc<dyn PageArray> = Arc::new(MemPageArray::new(64));
        array.set_page_count(4).unwrap();
        let header = Header::new(array.clone(), [0, 1]);
        let cp = Checkpointer::new(header, 0, 0);
        let cache = NodeCache::new(8);
        let alloc = PageAllocator::new(2);
        let dir = tempfile::tempdir().unwrap();
        let redo = RedoLog::create_or_open(dir.path().join("r.log")).unwrap();

        use crate::listener::NullListener;
        cp.run(&cache, array.as_ref(), &alloc, &redo, 5, &NullListener).unwrap();

        let header2 = Header::new(array.clone(), [0, 1]);
        let latest = header2.read_latest().unwrap().unwrap();
        assert_eq!(latest.root_page, 5);
        assert_eq!(latest.generation, 1);
    }
}
