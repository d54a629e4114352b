//! Index catalog (part of C1/C3, `spec.md` §3: "index 0 is reserved for the
//! registry of indexes").
//!
//! Named secondary indexes are tracked as ordinary entries in the default
//! tree under reserved key prefixes, the same trick `recovery.rs` already
//! uses for the fragmented-value trash (`\xFF\xFFtrash`): this avoids a
//! second durable root-pointer slot in the page-array header just for index
//! bookkeeping. Two prefixes are kept in sync for every index:
//!
//! - `NAME_PREFIX ++ name` -> the index's id, so `Database::find_index` is a
//!   single point lookup.
//! - `ROOT_PREFIX ++ id (big-endian)` -> `name ++ root_page`, so recovery can
//!   range-scan every registered index and reopen its tree without needing
//!   the name lookup in the other direction.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{DbError, DbResult};
use crate::tree::cursor::BTree;
use crate::tree::node::{Entry, ValueRepr};

const NAME_PREFIX: &[u8] = b"\xFF\xFFidx.name\0";
const ROOT_PREFIX: &[u8] = b"\xFF\xFFidx.root\0";

fn name_key(name: &[u8]) -> Vec<u8> {
    let mut k = NAME_PREFIX.to_vec();
    k.extend_from_slice(name);
    k
}

fn root_key(index_id: u64) -> Vec<u8> {
    let mut k = ROOT_PREFIX.to_vec();
    k.write_u64::<BigEndian>(index_id).unwrap();
    k
}

fn encode_root_value(name: &[u8], root_page: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + name.len() + 8);
    v.write_u32::<LittleEndian>(name.len() as u32).unwrap();
    v.extend_from_slice(name);
    v.write_u64::<LittleEndian>(root_page).unwrap();
    v
}

fn decode_root_value(bytes: &[u8]) -> DbResult<(Vec<u8>, u64)> {
    let mut r = bytes;
    let nlen = r
        .read_u32::<LittleEndian>()
        .map_err(|_| DbError::Corrupt("truncated catalog root entry"))? as usize;
    if r.len() < nlen + 8 {
        return Err(DbError::Corrupt("truncated catalog root entry"));
    }
    let name = r[..nlen].to_vec();
    let mut tail = &r[nlen..];
    let root_page = tail
        .read_u64::<LittleEndian>()
        .map_err(|_| DbError::Corrupt("truncated catalog root entry"))?;
    Ok((name, root_page))
}

/// A registered secondary index as scanned out of the catalog.
pub struct CatalogEntry {
    pub index_id: u64,
    pub name: Vec<u8>,
    pub root_page: u64,
}

/// Register a freshly created index durably in the default tree.
pub fn put_entry(default_tree: &BTree, index_id: u64, name: &[u8], root_page: u64) -> DbResult<()> {
    default_tree.insert(&name_key(name), ValueRepr::Inline(index_id.to_le_bytes().to_vec()))?;
    default_tree.insert(&root_key(index_id), ValueRepr::Inline(encode_root_value(name, root_page)))?;
    Ok(())
}

/// Update an existing index's recorded root page, e.g. after a root split or
/// collapse changes which page id is the tree's root.
pub fn update_root(default_tree: &BTree, index_id: u64, name: &[u8], root_page: u64) -> DbResult<()> {
    default_tree.insert(&root_key(index_id), ValueRepr::Inline(encode_root_value(name, root_page)))?;
    Ok(())
}

/// Remove an index's catalog entries (both directions). The name direction
/// is recovered from the root entry itself, so callers that only know
/// `index_id` (recovery replaying a `RedoOp::DropIndex`) don't need it.
pub fn remove_entry(default_tree: &BTree, index_id: u64) -> DbResult<()> {
    if let Some(Entry::Leaf { value: ValueRepr::Inline(bytes), .. }) = default_tree.find(&root_key(index_id))? {
        let (name, _) = decode_root_value(&bytes)?;
        default_tree.delete(&name_key(&name), false)?;
    }
    default_tree.delete(&root_key(index_id), false)?;
    Ok(())
}

/// Look up an index's id by name.
pub fn find_id_by_name(default_tree: &BTree, name: &[u8]) -> DbResult<Option<u64>> {
    match default_tree.find(&name_key(name))? {
        Some(Entry::Leaf { value: ValueRepr::Inline(bytes), .. }) if bytes.len() == 8 => {
            Ok(Some(u64::from_le_bytes(bytes.try_into().unwrap())))
        }
        _ => Ok(None),
    }
}

/// Walk every registered index out of the catalog, for reconstructing the
/// in-memory index map at open time.
pub fn scan_all(default_tree: &BTree) -> DbResult<Vec<CatalogEntry>> {
    let mut out = Vec::new();
    let mut cursor = default_tree.find_ge(ROOT_PREFIX)?;
    while let Some(entry) = &cursor {
        if !entry.key().starts_with(ROOT_PREFIX) {
            break;
        }
        let Entry::Leaf { key, value } = entry else { break };
        let Some(id_bytes) = key.get(ROOT_PREFIX.len()..) else { break };
        if id_bytes.len() != 8 {
            return Err(DbError::Corrupt("malformed catalog root key"));
        }
        let index_id = u64::from_be_bytes(id_bytes.try_into().unwrap());
        let ValueRepr::Inline(bytes) = value else {
            return Err(DbError::Corrupt("catalog root entry was not inline"));
        };
        let (name, root_page) = decode_root_value(bytes)?;
        let key = key.clone();
        out.push(CatalogEntry { index_id, name, root_page });
        cursor = default_tree.find_gt(&key)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PageAllocator;
    use crate::cache::NodeCache;
    use crate::page_array::{MemPageArray, PageArray};
    use std::sync::Arc;

    fn new_tree() -> BTree {
        let array: Arc<dyn PageArray> = Arc::new(MemPageArray::new(256));
        let alloc = Arc::new(PageAllocator::new(0));
        let cache = Arc::new(NodeCache::new(64));
        BTree::open(array, alloc, cache, 256, None, crate::tree::cursor::DEFAULT_INDEX_ID).unwrap()
    }

    #[test]
    fn put_then_find_by_name_round_trips() {
        let tree = new_tree();
        put_entry(&tree, 42, b"secondary", 7).unwrap();
        assert_eq!(find_id_by_name(&tree, b"secondary").unwrap(), Some(42));
    }

    #[test]
    fn scan_all_reports_every_registered_index() {
        let tree = new_tree();
        put_entry(&tree, 10, b"a", 1).unwrap();
        put_entry(&tree, 20, b"b", 2).unwrap();
        let entries = scan_all(&tree).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.index_id == 10 && e.name == b"a" && e.root_page == 1));
        assert!(entries.iter().any(|e| e.index_id == 20 && e.name == b"b" && e.root_page == 2));
    }

    #[test]
    fn update_root_changes_only_the_root_entry() {
        let tree = new_tree();
        put_entry(&tree, 5, b"x", 1).unwrap();
        update_root(&tree, 5, b"x", 99).unwrap();
        let entries = scan_all(&tree).unwrap();
        assert_eq!(entries[0].root_page, 99);
        assert_eq!(find_id_by_name(&tree, b"x").unwrap(), Some(5));
    }

    #[test]
    fn remove_entry_clears_both_directions() {
        let tree = new_tree();
        put_entry(&tree, 5, b"x", 1).unwrap();
        remove_entry(&tree, 5).unwrap();
        assert_eq!(find_id_by_name(&tree, b"x").unwrap(), None);
        assert!(scan_all(&tree).unwrap().is_empty());
    }
}
