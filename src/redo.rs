//! Redo log (C8, `spec.md` §4.8).
//!
//! A sequential append-only log of committed operations, replayed during
//! recovery to bring the last checkpoint forward to the point of the crash.
//! Entries are grouped into batches; a batch's durability is governed by the
//! owning transaction's [`DurabilityMode`](crate::txn::DurabilityMode).
//! Group commit batches multiple transactions' entries into one `fsync`,
//! the same way the teacher batches writes through a single `memmap2` flush
//! rather than one syscall per mutation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{DbError, DbResult};
use crate::txn::DurabilityMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    /// Insert or overwrite `key` with `value` in index `index_id`, produced
    /// by transaction `txn_id`. `txn_id` travels with the record itself
    /// (rather than being inferred from file position) since `RedoLog::append`
    /// takes the file mutex per record, not per batch, so concurrent
    /// transactions' records can interleave in the log.
    Store { txn_id: u64, index_id: u64, key: Vec<u8>, value: Vec<u8> },
    /// Delete `key` from index `index_id`, produced by transaction `txn_id`.
    Delete { txn_id: u64, index_id: u64, key: Vec<u8> },
    /// Create a new named index, assigning it `index_id`.
    CreateIndex { index_id: u64, name: Vec<u8> },
    /// Drop an index entirely.
    DropIndex { index_id: u64 },
    /// Marks the end of transaction `txn_id`'s operations in this log,
    /// making them visible to recovery as a unit.
    TxnCommit { txn_id: u64 },
    /// Two-phase commit prepare marker.
    TxnPrepare { txn_id: u64, handler_name: String, message: Vec<u8> },
    /// A fuzzy checkpoint boundary: recovery may stop replaying older
    /// entries once it has passed one of these for every still-open
    /// transaction (`spec.md` §4.10).
    CheckpointMark { checkpoint_id: u64 },
}

impl RedoOp {
    fn tag(&self) -> u8 {
        match self {
            RedoOp::Store { .. } => 1,
            RedoOp::Delete { .. } => 2,
            RedoOp::CreateIndex { .. } => 3,
            RedoOp::DropIndex { .. } => 4,
            RedoOp::TxnCommit { .. } => 5,
            RedoOp::TxnPrepare { .. } => 6,
            RedoOp::CheckpointMark { .. } => 7,
        }
    }

    fn encode(&self, w: &mut Vec<u8>) {
        w.push(self.tag());
        match self {
            RedoOp::Store { txn_id, index_id, key, value } => {
                w.write_u64::<LittleEndian>(*txn_id).unwrap();
                w.write_u64::<LittleEndian>(*index_id).unwrap();
                w.write_u32::<LittleEndian>(key.len() as u32).unwrap();
                w.extend_from_slice(key);
                w.write_u32::<LittleEndian>(value.len() as u32).unwrap();
                w.extend_from_slice(value);
            }
            RedoOp::Delete { txn_id, index_id, key } => {
                w.write_u64::<LittleEndian>(*txn_id).unwrap();
                w.write_u64::<LittleEndian>(*index_id).unwrap();
                w.write_u32::<LittleEndian>(key.len() as u32).unwrap();
                w.extend_from_slice(key);
            }
            RedoOp::CreateIndex { index_id, name } => {
                w.write_u64::<LittleEndian>(*index_id).unwrap();
                w.write_u32::<LittleEndian>(name.len() as u32).unwrap();
                w.extend_from_slice(name);
            }
            RedoOp::DropIndex { index_id } => {
                w.write_u64::<LittleEndian>(*index_id).unwrap();
            }
            RedoOp::TxnCommit { txn_id } => {
                w.write_u64::<LittleEndian>(*txn_id).unwrap();
            }
            RedoOp::TxnPrepare { txn_id, handler_name, message } => {
                w.write_u64::<LittleEndian>(*txn_id).unwrap();
                w.write_u32::<LittleEndian>(handler_name.len() as u32).unwrap();
                w.extend_from_slice(handler_name.as_bytes());
                w.write_u32::<LittleEndian>(message.len() as u32).unwrap();
                w.extend_from_slice(message);
            }
            RedoOp::CheckpointMark { checkpoint_id } => {
                w.write_u64::<LittleEndian>(*checkpoint_id).unwrap();
            }
        }
    }

    fn decode(tag: u8, r: &mut impl Read) -> DbResult<Self> {
        let read_bytes = |r: &mut dyn Read, n: usize| -> DbResult<Vec<u8>> {
            let mut buf = vec![0u8; n];
            r.read_exact(&mut buf)
                .map_err(|_| DbError::Corrupt("truncated redo record"))?;
            Ok(buf)
        };
        match tag {
            1 => {
                let txn_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo store"))?;
                let index_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo store"))?;
                let klen = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo store"))? as usize;
                let key = read_bytes(r, klen)?;
                let vlen = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo store"))? as usize;
                let value = read_bytes(r, vlen)?;
                Ok(RedoOp::Store { txn_id, index_id, key, value })
            }
            2 => {
                let txn_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo delete"))?;
                let index_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo delete"))?;
                let klen = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo delete"))? as usize;
                let key = read_bytes(r, klen)?;
                Ok(RedoOp::Delete { txn_id, index_id, key })
            }
            3 => {
                let index_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo create_index"))?;
                let nlen = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo create_index"))? as usize;
                let name = read_bytes(r, nlen)?;
                Ok(RedoOp::CreateIndex { index_id, name })
            }
            4 => {
                let index_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo drop_index"))?;
                Ok(RedoOp::DropIndex { index_id })
            }
            5 => {
                let txn_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo commit"))?;
                Ok(RedoOp::TxnCommit { txn_id })
            }
            6 => {
                let txn_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo prepare"))?;
                let hlen = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo prepare"))? as usize;
                let handler_name = String::from_utf8(read_bytes(r, hlen)?)
                    .map_err(|_| DbError::Corrupt("redo prepare handler name was not utf8"))?;
                let mlen = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo prepare"))? as usize;
                let message = read_bytes(r, mlen)?;
                Ok(RedoOp::TxnPrepare { txn_id, handler_name, message })
            }
            7 => {
                let checkpoint_id = r.read_u64::<LittleEndian>().map_err(|_| DbError::Corrupt("truncated redo checkpoint mark"))?;
                Ok(RedoOp::CheckpointMark { checkpoint_id })
            }
            _ => Err(DbError::Corrupt("unknown redo op tag")),
        }
    }
}

/// A durable, append-only redo log file. Each record is length-prefixed and
/// trailed with a CRC32C checksum over the record bytes, matching
/// `spec.md`'s explicit choice of CRC32C for the redo log and page-array
/// headers (internal node/undo checksums continue to use the teacher's
/// xxh3, per the design note in `SPEC_FULL.md`).
pub struct RedoLog {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    next_seq: AtomicU64,
}

impl RedoLog {
    pub fn create_or_open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(BufWriter::new(file)),
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, returning its sequence number. Durability beyond
    /// "written to the OS buffer" is the caller's responsibility via
    /// [`RedoLog::sync`], dispatched according to the transaction's
    /// [`DurabilityMode`].
    pub fn append(&self, op: &RedoOp) -> DbResult<u64> {
        let mut buf = Vec::new();
        op.encode(&mut buf);
        let checksum = crc32c::crc32c(&buf);

        let mut file = self.file.lock().unwrap();
        file.write_u32::<LittleEndian>(buf.len() as u32)?;
        file.write_all(&buf)?;
        file.write_u32::<LittleEndian>(checksum)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        Ok(seq)
    }

    /// Append a whole transaction's worth of operations as one batch,
    /// followed by a commit marker, and sync according to `mode`. This is
    /// the group-commit unit: concurrent committers append their own
    /// batches but may share the trailing `sync` call at a higher layer
    /// (left to the database/checkpointer glue, not this log itself).
    pub fn append_batch(&self, txn_id: u64, ops: &[RedoOp], mode: DurabilityMode) -> DbResult<()> {
        for op in ops {
            self.append(op)?;
        }
        self.append(&RedoOp::TxnCommit { txn_id })?;
        match mode {
            DurabilityMode::NoRedo => {}
            DurabilityMode::NoFlush => {}
            DurabilityMode::NoSync => self.flush_buffer()?,
            DurabilityMode::Sync => {
                self.flush_buffer()?;
                self.sync()?;
            }
        }
        Ok(())
    }

    fn flush_buffer(&self) -> DbResult<()> {
        self.file.lock().unwrap().flush()?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        let mut file = self.file.lock().unwrap();
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(())
    }

    /// Truncate the log back to empty, called once a checkpoint has made
    /// every record in it durable in the tree itself (`spec.md` §4.10 step
    /// 7).
    pub fn truncate(&self) -> DbResult<()> {
        let mut file = self.file.lock().unwrap();
        file.flush()?;
        file.get_ref().set_len(0)?;
        use std::io::Seek;
        file.get_mut().seek(std::io::SeekFrom::Start(0))?;
        Ok(())
    }

    /// Replay every well-formed record in the log in order, stopping (not
    /// erroring) at the first truncated or checksum-mismatched record,
    /// since that is exactly what an interrupted partial write at crash
    /// time looks like (`spec.md` §4.11 Recovery: idempotent, tolerant of a
    /// torn final write).
    pub fn replay<F: FnMut(RedoOp) -> DbResult<()>>(path: &Path, mut visit: F) -> DbResult<usize> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DbError::Io(e)),
        };
        let mut applied = 0;
        loop {
            let len = match file.read_u32::<LittleEndian>() {
                Ok(n) => n,
                Err(_) => break,
            };
            let mut buf = vec![0u8; len as usize];
            if file.read_exact(&mut buf).is_err() {
                break;
            }
            let stored_checksum = match file.read_u32::<LittleEndian>() {
                Ok(c) => c,
                Err(_) => break,
            };
            if crc32c::crc32c(&buf) != stored_checksum {
                break;
            }
            let tag = buf[0];
            let op = match RedoOp::decode(tag, &mut &buf[1..]) {
                Ok(op) => op,
                Err(_) => break,
            };
            visit(op)?;
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::create_or_open(&path).unwrap();
        log.append_batch(
            1,
            &[RedoOp::Store {
                txn_id: 1,
                index_id: 0,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
            DurabilityMode::Sync,
        )
        .unwrap();

        let mut seen = Vec::new();
        let n = RedoLog::replay(&path, |op| {
            seen.push(op);
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 2);
        assert!(matches!(seen[0], RedoOp::Store { .. }));
        assert!(matches!(seen[1], RedoOp::TxnCommit { txn_id: 1 }));
    }

    #[test]
    fn truncate_empties_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        let log = RedoLog::create_or_open(&path).unwrap();
        log.append(&RedoOp::DropIndex { index_id: 1 }).unwrap();
        log.truncate().unwrap();
        let n = RedoLog::replay(&path, |_| Ok(())).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn replay_stops_at_torn_final_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo.log");
        {
            let log = RedoLog::create_or_open(&path).unwrap();
            log.append(&RedoOp::DropIndex { index_id: 1 }).unwrap();
        }
        // Simulate a torn write: append a partial length prefix only.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

        let mut seen = Vec::new();
        let n = RedoLog::replay(&path, |op| {
            seen.push(op);
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 1);
    }
}
