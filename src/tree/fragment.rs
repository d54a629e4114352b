//! Large value / fragmented write support (part of C6, `spec.md` §4.6
//! "Large values / fragmented writes").
//!
//! A value becomes fragmented once it is too large to store inline in a
//! leaf entry. Direct fragmentation stores the trailing bytes as a flat list
//! of directly-addressed page ids; once that list itself would not fit
//! inline, indirect fragmentation adds a tree of pointer pages, each
//! pointing at a block of direct value pages.

use crate::alloc::PageAllocator;
use crate::error::{DbError, DbResult};
use crate::page_array::PageArray;
use crate::tree::node::ValueRepr;
use crate::undo::{UndoLog, UndoRecord};

/// Threshold, in bytes, above which a leaf value is stored fragmented rather
/// than inline. Conservatively a fraction of the page, leaving room for
/// several entries per leaf.
pub fn inline_threshold(page_size: usize) -> usize {
    page_size / 4
}

/// How many direct page ids a fragmented-direct value's inline head budget
/// allows before the direct list itself must move to indirect pointer
/// pages.
fn max_direct_pages(page_size: usize) -> usize {
    // Reserve roughly a quarter of the page for the id list; 8 bytes/id.
    (page_size / 4) / 8
}

fn pages_for_len(len: u64, page_size: usize) -> u64 {
    len.div_ceil(page_size as u64)
}

/// Allocate pages and write `value` out as a fragmented representation.
/// `head_len` bytes are kept inline (header), the remainder spread across
/// page-size chunks.
pub fn fragment_value(
    value: &[u8],
    page_size: usize,
    alloc: &PageAllocator,
    array: &dyn PageArray,
) -> DbResult<ValueRepr> {
    let head_len = (page_size / 16).min(value.len());
    let inline_head = value[..head_len].to_vec();
    let remainder = &value[head_len..];
    let n_pages = pages_for_len(remainder.len() as u64, page_size) as usize;

    let mut pages = Vec::with_capacity(n_pages);
    for i in 0..n_pages {
        let start = i * page_size;
        let end = (start + page_size).min(remainder.len());
        let mut buf = vec![0u8; page_size];
        buf[..end - start].copy_from_slice(&remainder[start..end]);
        let page = alloc.alloc()?.page;
        array.write_page(page, &buf)?;
        pages.push(page);
    }

    if pages.len() <= max_direct_pages(page_size) {
        Ok(ValueRepr::FragmentedDirect {
            total_len: value.len() as u64,
            inline_head,
            pages,
        })
    } else {
        // Indirect tier: group direct pages under pointer pages.
        let ids_per_pointer = (page_size / 8).max(1);
        let mut pointer_pages = Vec::new();
        for chunk in pages.chunks(ids_per_pointer) {
            let mut buf = vec![0u8; page_size];
            for (i, id) in chunk.iter().enumerate() {
                buf[i * 8..i * 8 + 8].copy_from_slice(&id.to_le_bytes());
            }
            let ptr_page = alloc.alloc()?.page;
            array.write_page(ptr_page, &buf)?;
            pointer_pages.push(ptr_page);
        }
        Ok(ValueRepr::FragmentedIndirect {
            total_len: value.len() as u64,
            inline_head,
            pointer_pages,
        })
    }
}

/// Resolve a [`ValueRepr::FragmentedIndirect`]'s pointer pages back into a
/// flat list of direct value page ids.
fn resolve_indirect_pages(
    pointer_pages: &[u64],
    total_remainder_pages: u64,
    page_size: usize,
    array: &dyn PageArray,
) -> DbResult<Vec<u64>> {
    let ids_per_pointer = (page_size / 8).max(1);
    let mut out = Vec::with_capacity(total_remainder_pages as usize);
    'outer: for ptr in pointer_pages {
        let mut buf = vec![0u8; page_size];
        array.read_page(*ptr, &mut buf)?;
        for i in 0..ids_per_pointer {
            if out.len() as u64 >= total_remainder_pages {
                break 'outer;
            }
            let id = u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
            out.push(id);
        }
    }
    Ok(out)
}

/// Read `len` bytes starting at `pos` from a (possibly fragmented) value.
pub fn read_value(
    value: &ValueRepr,
    pos: u64,
    len: usize,
    page_size: usize,
    array: &dyn PageArray,
) -> DbResult<Vec<u8>> {
    match value {
        ValueRepr::Inline(bytes) => {
            let pos = pos as usize;
            let end = (pos + len).min(bytes.len());
            if pos >= bytes.len() {
                return Ok(Vec::new());
            }
            Ok(bytes[pos..end].to_vec())
        }
        ValueRepr::FragmentedDirect {
            total_len,
            inline_head,
            pages,
        } => read_fragmented(*total_len, inline_head, pages, pos, len, page_size, array),
        ValueRepr::FragmentedIndirect {
            total_len,
            inline_head,
            pointer_pages,
        } => {
            let remainder_len = *total_len - inline_head.len() as u64;
            let n_pages = pages_for_len(remainder_len, page_size);
            let pages = resolve_indirect_pages(pointer_pages, n_pages, page_size, array)?;
            read_fragmented(*total_len, inline_head, &pages, pos, len, page_size, array)
        }
    }
}

fn read_fragmented(
    total_len: u64,
    inline_head: &[u8],
    pages: &[u64],
    pos: u64,
    len: usize,
    page_size: usize,
    array: &dyn PageArray,
) -> DbResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let head_len = inline_head.len() as u64;
    let mut cur = pos;
    let end = (pos + len as u64).min(total_len);
    while cur < end {
        if cur < head_len {
            let take = ((head_len - cur).min(end - cur)) as usize;
            out.extend_from_slice(&inline_head[cur as usize..cur as usize + take]);
            cur += take as u64;
            continue;
        }
        let rel = cur - head_len;
        let page_idx = (rel / page_size as u64) as usize;
        let page_off = (rel % page_size as u64) as usize;
        let take = ((page_size - page_off) as u64).min(end - cur) as usize;
        let page_id = *pages
            .get(page_idx)
            .ok_or(DbError::Corrupt("fragmented value page index out of range"))?;
        let mut buf = vec![0u8; page_size];
        array.read_page(page_id, &mut buf)?;
        out.extend_from_slice(&buf[page_off..page_off + take]);
        cur += take as u64;
    }
    Ok(out)
}

/// Write `buf` at `pos` into a value, converting it to fragmented
/// representation first if it is currently inline and the write would push
/// it over the inline threshold.
///
/// When the value is already `FragmentedDirect` and stays within that tier
/// after the write, only the pages the write actually touches are
/// copy-on-written: each replaced page is freed immediately (safe because
/// `PageAllocator::free` only retires a page once the allocator's
/// generation has advanced past every reader that could still see it — the
/// same reasoning `BTree::fix_underflow` already relies on for in-place
/// merges) and the freshly allocated replacement is recorded via
/// `UndoRecord::UnAlloc` so a rollback that restores the old representation
/// also reclaims it. A tier transition (inline -> fragmented or
/// direct -> indirect) still falls back to a whole-value rewrite.
#[allow(clippy::too_many_arguments)]
pub fn write_value(
    value: ValueRepr,
    pos: u64,
    buf: &[u8],
    page_size: usize,
    alloc: &PageAllocator,
    array: &dyn PageArray,
    undo: &mut UndoLog,
    index_id: u64,
    txn_key: &[u8],
) -> DbResult<ValueRepr> {
    let new_len = (pos + buf.len() as u64).max(value.total_len());
    let threshold = inline_threshold(page_size) as u64;

    if let ValueRepr::FragmentedDirect {
        total_len,
        inline_head,
        pages,
    } = &value
    {
        let head_len = inline_head.len() as u64;
        let n_pages_after = pages_for_len(new_len.saturating_sub(head_len), page_size) as usize;
        if n_pages_after <= max_direct_pages(page_size) {
            return write_value_direct_incremental(
                *total_len,
                inline_head.clone(),
                pages.clone(),
                pos,
                buf,
                new_len,
                page_size,
                alloc,
                array,
                undo,
                index_id,
                txn_key,
            );
        }
    }

    let old_total = value.total_len() as usize;
    let mut full = read_value(&value, 0, old_total, page_size, array)?;
    if full.len() < new_len as usize {
        full.resize(new_len as usize, 0);
    }
    let start = pos as usize;
    full[start..start + buf.len()].copy_from_slice(buf);

    undo.push(UndoRecord::UnWrite {
        index_id,
        key: txn_key.to_vec(),
        old_value: value.clone(),
    });

    let new_repr = if (full.len() as u64) <= threshold {
        ValueRepr::Inline(full)
    } else {
        fragment_value(&full, page_size, alloc, array)?
    };
    free_fragmented_pages(&value, page_size, alloc, array)?;
    Ok(new_repr)
}

#[allow(clippy::too_many_arguments)]
fn write_value_direct_incremental(
    total_len: u64,
    inline_head: Vec<u8>,
    mut pages: Vec<u64>,
    pos: u64,
    buf: &[u8],
    new_len: u64,
    page_size: usize,
    alloc: &PageAllocator,
    array: &dyn PageArray,
    undo: &mut UndoLog,
    index_id: u64,
    txn_key: &[u8],
) -> DbResult<ValueRepr> {
    undo.push(UndoRecord::UnWrite {
        index_id,
        key: txn_key.to_vec(),
        old_value: ValueRepr::FragmentedDirect {
            total_len,
            inline_head: inline_head.clone(),
            pages: pages.clone(),
        },
    });

    let head_len = inline_head.len() as u64;
    let write_start = pos;
    let write_end = pos + buf.len() as u64;

    let mut new_inline_head = inline_head;
    if write_start < head_len {
        let take = (head_len - write_start).min(write_end.saturating_sub(write_start)) as usize;
        let head_off = write_start as usize;
        if new_inline_head.len() < head_off + take {
            new_inline_head.resize(head_off + take, 0);
        }
        new_inline_head[head_off..head_off + take].copy_from_slice(&buf[..take]);
    }

    let rem_write_start = write_start.saturating_sub(head_len);
    let rem_write_end = write_end.saturating_sub(head_len);
    let n_pages_after = pages_for_len(new_len.saturating_sub(head_len), page_size) as usize;
    let old_pages_len = pages.len();

    // Growth: fresh, zero-filled pages for newly-needed remainder space.
    for _ in old_pages_len..n_pages_after {
        let new_page = alloc.alloc()?.page;
        array.write_page(new_page, &vec![0u8; page_size])?;
        undo.push(UndoRecord::UnAlloc { page: new_page });
        pages.push(new_page);
    }

    if write_end > head_len && !pages.is_empty() {
        let first_page = (rem_write_start / page_size as u64) as usize;
        let last_page = (rem_write_end.saturating_sub(1) / page_size as u64) as usize;
        let last_page = last_page.min(pages.len() - 1);
        for page_idx in first_page..=last_page {
            let page_start_rem = page_idx as u64 * page_size as u64;
            let page_end_rem = page_start_rem + page_size as u64;
            let seg_start_rem = rem_write_start.max(page_start_rem);
            let seg_end_rem = rem_write_end.min(page_end_rem);
            if seg_end_rem <= seg_start_rem {
                continue;
            }
            let in_page_off = (seg_start_rem - page_start_rem) as usize;
            let len = (seg_end_rem - seg_start_rem) as usize;
            let abs_start = seg_start_rem + head_len;
            let buf_off = (abs_start - write_start) as usize;

            if page_idx < old_pages_len {
                // Pre-existing page: copy-on-write so the old copy remains
                // intact for a rollback restoring the pre-write representation.
                let old_page = pages[page_idx];
                let mut page_buf = vec![0u8; page_size];
                array.read_page(old_page, &mut page_buf)?;
                page_buf[in_page_off..in_page_off + len].copy_from_slice(&buf[buf_off..buf_off + len]);
                let new_page = alloc.alloc()?.page;
                array.write_page(new_page, &page_buf)?;
                undo.push(UndoRecord::UnAlloc { page: new_page });
                alloc.free(old_page);
                pages[page_idx] = new_page;
            } else {
                // Freshly allocated by the growth step above this call: no
                // other representation can reference it, so patch in place.
                let page_id = pages[page_idx];
                let mut page_buf = vec![0u8; page_size];
                array.read_page(page_id, &mut page_buf)?;
                page_buf[in_page_off..in_page_off + len].copy_from_slice(&buf[buf_off..buf_off + len]);
                array.write_page(page_id, &page_buf)?;
            }
        }
    }

    Ok(ValueRepr::FragmentedDirect {
        total_len: new_len,
        inline_head: new_inline_head,
        pages,
    })
}

/// Truncate or extend a value's logical length.
///
/// Mirrors [`write_value`]'s incremental strategy: a `FragmentedDirect`
/// value that stays in that tier only has its page list grown or shrunk
/// (excess pages freed immediately, new pages allocated and recorded via
/// `UnAlloc`) rather than being read back in full and re-fragmented.
#[allow(clippy::too_many_arguments)]
pub fn set_value_length(
    value: ValueRepr,
    new_len: u64,
    page_size: usize,
    alloc: &PageAllocator,
    array: &dyn PageArray,
    undo: &mut UndoLog,
    index_id: u64,
    txn_key: &[u8],
) -> DbResult<ValueRepr> {
    let threshold = inline_threshold(page_size) as u64;

    if let ValueRepr::FragmentedDirect {
        total_len,
        inline_head,
        pages,
    } = &value
    {
        let head_len = inline_head.len() as u64;
        let n_pages_after = pages_for_len(new_len.saturating_sub(head_len), page_size) as usize;
        if new_len > threshold && n_pages_after <= max_direct_pages(page_size) {
            return set_length_direct_incremental(
                *total_len,
                inline_head.clone(),
                pages.clone(),
                new_len,
                page_size,
                alloc,
                array,
                undo,
                index_id,
                txn_key,
            );
        }
    }

    let old_total = value.total_len();
    let mut full = read_value(&value, 0, old_total as usize, page_size, array)?;
    undo.push(UndoRecord::UnExtend {
        index_id,
        key: txn_key.to_vec(),
        old_value: value.clone(),
    });
    full.resize(new_len as usize, 0);
    let new_repr = if new_len <= threshold {
        ValueRepr::Inline(full)
    } else {
        fragment_value(&full, page_size, alloc, array)?
    };
    free_fragmented_pages(&value, page_size, alloc, array)?;
    Ok(new_repr)
}

#[allow(clippy::too_many_arguments)]
fn set_length_direct_incremental(
    total_len: u64,
    inline_head: Vec<u8>,
    mut pages: Vec<u64>,
    new_len: u64,
    page_size: usize,
    alloc: &PageAllocator,
    array: &dyn PageArray,
    undo: &mut UndoLog,
    index_id: u64,
    txn_key: &[u8],
) -> DbResult<ValueRepr> {
    undo.push(UndoRecord::UnExtend {
        index_id,
        key: txn_key.to_vec(),
        old_value: ValueRepr::FragmentedDirect {
            total_len,
            inline_head: inline_head.clone(),
            pages: pages.clone(),
        },
    });

    let head_len = inline_head.len() as u64;
    let remainder_len_after = new_len.saturating_sub(head_len);
    let n_pages_after = pages_for_len(remainder_len_after, page_size) as usize;
    let shrinking = new_len < total_len;

    if n_pages_after < pages.len() {
        for p in pages.split_off(n_pages_after) {
            alloc.free(p);
        }
    } else {
        for _ in pages.len()..n_pages_after {
            let new_page = alloc.alloc()?.page;
            array.write_page(new_page, &vec![0u8; page_size])?;
            undo.push(UndoRecord::UnAlloc { page: new_page });
            pages.push(new_page);
        }
    }

    // A shrink landing mid-page must zero the now-unused tail of the final
    // retained page, so a later extend over the same page doesn't resurrect
    // bytes that were logically truncated away.
    if shrinking {
        if let Some(&last_page) = pages.last() {
            let used_in_last = remainder_len_after - (pages.len() as u64 - 1) * page_size as u64;
            if used_in_last < page_size as u64 {
                let mut buf = vec![0u8; page_size];
                array.read_page(last_page, &mut buf)?;
                for b in &mut buf[used_in_last as usize..] {
                    *b = 0;
                }
                let new_page = alloc.alloc()?.page;
                array.write_page(new_page, &buf)?;
                undo.push(UndoRecord::UnAlloc { page: new_page });
                alloc.free(last_page);
                *pages.last_mut().unwrap() = new_page;
            }
        }
    }

    Ok(ValueRepr::FragmentedDirect {
        total_len: new_len,
        inline_head,
        pages,
    })
}

/// Free every page backing a fragmented value. Used both for immediate
/// non-transactional trash drainage and for recovery cleanup.
pub fn free_fragmented_pages(
    value: &ValueRepr,
    page_size: usize,
    alloc: &PageAllocator,
    array: &dyn PageArray,
) -> DbResult<()> {
    match value {
        ValueRepr::Inline(_) => {}
        ValueRepr::FragmentedDirect { pages, .. } => {
            for p in pages {
                alloc.free(*p);
            }
        }
        ValueRepr::FragmentedIndirect {
            total_len,
            inline_head,
            pointer_pages,
        } => {
            let remainder_len = *total_len - inline_head.len() as u64;
            let n_pages = pages_for_len(remainder_len, page_size);
            let pages = resolve_indirect_pages(pointer_pages, n_pages, page_size, array)?;
            for p in pages {
                alloc.free(p);
            }
            for p in pointer_pages {
                alloc.free(*p);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_array::MemPageArray;

    #[test]
    fn fragment_and_read_back_round_trips() {
        let array = MemPageArray::new(256);
        let alloc = PageAllocator::new(0);
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let repr = fragment_value(&data, 256, &alloc, &array).unwrap();
        assert!(repr.is_fragmented());
        let read_back = read_value(&repr, 0, data.len(), 256, &array).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn partial_read_within_fragment() {
        let array = MemPageArray::new(256);
        let alloc = PageAllocator::new(0);
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let repr = fragment_value(&data, 256, &alloc, &array).unwrap();
        let chunk = read_value(&repr, 1000, 50, 256, &array).unwrap();
        assert_eq!(chunk, data[1000..1050]);
    }

    #[test]
    fn large_values_use_indirect_tier() {
        let array = MemPageArray::new(64);
        let alloc = PageAllocator::new(0);
        let data = vec![7u8; 64 * 64];
        let repr = fragment_value(&data, 64, &alloc, &array).unwrap();
        assert!(matches!(repr, ValueRepr::FragmentedIndirect { .. }));
        let read_back = read_value(&repr, 0, data.len(), 64, &array).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn set_length_truncates_preserving_prefix() {
        let array = MemPageArray::new(256);
        let alloc = PageAllocator::new(0);
        let mut undo = UndoLog::new(1);
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let repr = fragment_value(&data, 256, &alloc, &array).unwrap();
        let truncated =
            set_value_length(repr, 1000, 256, &alloc, &array, &mut undo, 1, b"k").unwrap();
        assert_eq!(truncated.total_len(), 1000);
        let read_back = read_value(&truncated, 0, 1000, 256, &array).unwrap();
        assert_eq!(read_back, data[..1000]);
    }

    #[test]
    fn repeated_partial_writes_do_not_leak_superseded_pages() {
        // Regression test: writing the same fragmented value in many small
        // chunks must not balloon the allocator's page count far beyond what
        // the final value actually needs.
        let array = MemPageArray::new(4096);
        let alloc = PageAllocator::new(0);
        let mut undo = UndoLog::new(1);
        let chunk = vec![0xAB; 16 * 1024];
        let total = 1024 * 1024usize;

        let mut value = ValueRepr::Inline(Vec::new());
        let mut written = 0u64;
        while (written as usize) < total {
            value = write_value(value, written, &chunk, 4096, &alloc, &array, &mut undo, 1, b"k")
                .unwrap();
            written += chunk.len() as u64;
        }

        let final_pages = match &value {
            ValueRepr::FragmentedDirect { pages, .. } => pages.len() as u64,
            ValueRepr::FragmentedIndirect { .. } => panic!("expected direct tier at this size"),
            ValueRepr::Inline(_) => panic!("expected fragmented value"),
        };
        // Only the pages actually backing the final value should remain
        // allocated once stale pending-frees are reclaimed; no concurrent
        // reader exists in this test so every free is immediately reclaimable.
        alloc.advance_generation(u64::MAX);
        assert!(alloc.allocated_count() - alloc.free_count() as u64 <= final_pages + 2);
    }
}
