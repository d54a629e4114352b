//! Lock manager (C5, `spec.md` §4.5).
//!
//! A named, transaction-scoped entity distinct from a [`crate::latch::Latch`]
//! (`spec.md` Glossary): a lock is keyed by `(index id, key)`, held across
//! potentially long waits, and participates in deadlock detection. The table
//! is sharded by hash to keep contention local, mirroring the teacher's
//! habit of sharding the page cache rather than using one global mutex.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DeadlockInfo, LockResult};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldMode {
    Shared,
    Upgradable,
    Exclusive,
}

struct LockEntry {
    /// Transaction ids holding this lock in `Shared` mode.
    shared_holders: Vec<u64>,
    /// At most one transaction may hold `Upgradable` at a time.
    upgradable_holder: Option<u64>,
    /// At most one transaction may hold `Exclusive`, and only if no shared
    /// holders remain.
    exclusive_holder: Option<u64>,
    /// Transaction ids parked waiting on this lock, in arrival order (fair
    /// FIFO per `spec.md` §4.5).
    waiters: Vec<u64>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            shared_holders: Vec::new(),
            upgradable_holder: None,
            exclusive_holder: None,
            waiters: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.shared_holders.is_empty()
            && self.upgradable_holder.is_none()
            && self.exclusive_holder.is_none()
            && self.waiters.is_empty()
    }

    fn mode_of(&self, txn_id: u64) -> Option<HeldMode> {
        if self.exclusive_holder == Some(txn_id) {
            Some(HeldMode::Exclusive)
        } else if self.upgradable_holder == Some(txn_id) {
            Some(HeldMode::Upgradable)
        } else if self.shared_holders.contains(&txn_id) {
            Some(HeldMode::Shared)
        } else {
            None
        }
    }
}

type LockKey = (u64, Vec<u8>);

struct Shard {
    locks: HashMap<LockKey, LockEntry>,
    /// Who is each waiting transaction blocked on, for deadlock detection's
    /// wait-for graph walk (`spec.md` §4.5).
    waiting_for: HashMap<u64, LockKey>,
}

/// The sharded lock table (`spec.md` §4.5).
pub struct LockManager {
    shards: Vec<Mutex<Shard>>,
    cond: Condvar,
}

fn shard_index(key: &LockKey) -> usize {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % SHARD_COUNT
}

impl LockManager {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(Shard {
                locks: HashMap::new(),
                waiting_for: HashMap::new(),
            }));
        }
        Self {
            shards,
            cond: Condvar::new(),
        }
    }

    /// Acquire a shared lock for `txn_id` on `(index_id, key)`, waiting up
    /// to `timeout` (`None` = wait forever, `Some(Duration::ZERO)` = try
    /// once). Detects deadlock before blocking.
    pub fn lock_shared(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> LockResult {
        self.acquire(txn_id, index_id, key, timeout, |entry, txn_id| {
            if entry.exclusive_holder.is_some() && entry.exclusive_holder != Some(txn_id) {
                return None;
            }
            entry.shared_holders.push(txn_id);
            Some(LockResult::Acquired)
        })
    }

    pub fn lock_upgradable(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> LockResult {
        self.acquire(txn_id, index_id, key, timeout, |entry, txn_id| {
            if entry.upgradable_holder.is_some() && entry.upgradable_holder != Some(txn_id) {
                return None;
            }
            if entry.exclusive_holder.is_some() && entry.exclusive_holder != Some(txn_id) {
                return None;
            }
            entry.upgradable_holder = Some(txn_id);
            Some(LockResult::Acquired)
        })
    }

    pub fn lock_exclusive(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
    ) -> LockResult {
        self.acquire(txn_id, index_id, key, timeout, |entry, txn_id| {
            let other_shared = entry.shared_holders.iter().any(|&h| h != txn_id);
            if other_shared {
                return None;
            }
            if entry.exclusive_holder.is_some() && entry.exclusive_holder != Some(txn_id) {
                return None;
            }
            if entry.upgradable_holder.is_some() && entry.upgradable_holder != Some(txn_id) {
                return None;
            }
            entry.shared_holders.retain(|&h| h != txn_id);
            entry.upgradable_holder = None;
            entry.exclusive_holder = Some(txn_id);
            Some(if entry.shared_holders.is_empty() {
                LockResult::Upgraded
            } else {
                LockResult::Acquired
            })
        })
    }

    fn acquire<F>(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        timeout: Option<Duration>,
        mut try_take: F,
    ) -> LockResult
    where
        F: FnMut(&mut LockEntry, u64) -> Option<LockResult>,
    {
        let lock_key: LockKey = (index_id, key.to_vec());
        let shard_idx = shard_index(&lock_key);
        let deadline = timeout.map(|d| Instant::now() + d);

        let mut guard = self.shards[shard_idx].lock().unwrap();
        loop {
            {
                let entry = guard.locks.entry(lock_key.clone()).or_insert_with(LockEntry::new);
                if let Some(already) = entry.mode_of(txn_id) {
                    return match already {
                        HeldMode::Shared => LockResult::OwnedShared,
                        HeldMode::Upgradable => LockResult::OwnedUpgradable,
                        HeldMode::Exclusive => LockResult::OwnedExclusive,
                    };
                }
                if let Some(result) = try_take(entry, txn_id) {
                    return result;
                }
            }

            if timeout == Some(Duration::ZERO) {
                return LockResult::TimedOut;
            }

            // Record the wait-for edge and check for a cycle before parking.
            guard.waiting_for.insert(txn_id, lock_key.clone());
            if let Some(cycle) = self.find_cycle(&guard, txn_id) {
                guard.waiting_for.remove(&txn_id);
                log::warn!("deadlock detected involving txn {txn_id} on index {index_id}");
                return LockResult::Deadlock(DeadlockInfo { locks: cycle });
            }
            if let Some(entry) = guard.locks.get_mut(&lock_key) {
                entry.waiters.push(txn_id);
            }

            guard = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        guard.waiting_for.remove(&txn_id);
                        return LockResult::TimedOut;
                    }
                    let (g, timeout_result) = self.cond.wait_timeout(guard, d - now).unwrap();
                    if timeout_result.timed_out() {
                        let mut g = g;
                        g.waiting_for.remove(&txn_id);
                        if let Some(entry) = g.locks.get_mut(&lock_key) {
                            entry.waiters.retain(|&w| w != txn_id);
                        }
                        return LockResult::TimedOut;
                    }
                    g
                }
                None => self.cond.wait(guard).unwrap(),
            };
            guard.waiting_for.remove(&txn_id);
            if let Some(entry) = guard.locks.get_mut(&lock_key) {
                entry.waiters.retain(|&w| w != txn_id);
            }
        }
    }

    /// Walk the wait-for graph starting from `start`, returning the cycle's
    /// `(index id, key)` lock path if it leads back to `start` (`spec.md`
    /// §4.5 deadlock detection).
    fn find_cycle(&self, guard: &Shard, start: u64) -> Option<Vec<LockKey>> {
        let mut seen = std::collections::HashSet::new();
        let mut cur = start;
        let mut path = Vec::new();
        loop {
            let blocking_key = guard.waiting_for.get(&cur)?;
            path.push(blocking_key.clone());
            let entry = guard.locks.get(blocking_key)?;
            let holders: Vec<u64> = entry
                .exclusive_holder
                .into_iter()
                .chain(entry.upgradable_holder)
                .chain(entry.shared_holders.iter().copied())
                .collect();
            // Only a single-holder chain is followed; a shared lock held by
            // multiple transactions cannot itself be the unique blocker on a
            // cycle edge we can prove here, so treat it as a dead end rather
            // than a false positive.
            if holders.len() != 1 {
                return None;
            }
            let next = holders[0];
            if next == start {
                return Some(path);
            }
            if !seen.insert(next) {
                return None;
            }
            cur = next;
        }
    }

    /// Release every lock mode `txn_id` holds on `(index_id, key)`.
    pub fn unlock(&self, txn_id: u64, index_id: u64, key: &[u8]) {
        let lock_key: LockKey = (index_id, key.to_vec());
        let shard_idx = shard_index(&lock_key);
        let mut guard = self.shards[shard_idx].lock().unwrap();
        let remove = if let Some(entry) = guard.locks.get_mut(&lock_key) {
            entry.shared_holders.retain(|&h| h != txn_id);
            if entry.upgradable_holder == Some(txn_id) {
                entry.upgradable_holder = None;
            }
            if entry.exclusive_holder == Some(txn_id) {
                entry.exclusive_holder = None;
            }
            entry.is_empty()
        } else {
            false
        };
        if remove {
            guard.locks.remove(&lock_key);
        }
        drop(guard);
        self.cond.notify_all();
    }

    /// Release every lock held anywhere by `txn_id`; used on transaction
    /// exit/rollback. `O(shards * locks)`, acceptable since it only runs on
    /// transaction teardown.
    pub fn unlock_all(&self, txn_id: u64) {
        for shard in &self.shards {
            let mut guard = shard.lock().unwrap();
            let mut empty_keys = Vec::new();
            for (key, entry) in guard.locks.iter_mut() {
                entry.shared_holders.retain(|&h| h != txn_id);
                if entry.upgradable_holder == Some(txn_id) {
                    entry.upgradable_holder = None;
                }
                if entry.exclusive_holder == Some(txn_id) {
                    entry.exclusive_holder = None;
                }
                if entry.is_empty() {
                    empty_keys.push(key.clone());
                }
            }
            for key in empty_keys {
                guard.locks.remove(&key);
            }
        }
        self.cond.notify_all();
    }

    pub fn is_locked(&self, index_id: u64, key: &[u8]) -> bool {
        let lock_key: LockKey = (index_id, key.to_vec());
        let shard_idx = shard_index(&lock_key);
        let guard = self.shards[shard_idx].lock().unwrap();
        guard.locks.get(&lock_key).is_some_and(|e| !e.is_empty())
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_are_compatible() {
        let mgr = LockManager::new();
        assert_eq!(mgr.lock_shared(1, 0, b"k", None), LockResult::Acquired);
        assert_eq!(mgr.lock_shared(2, 0, b"k", None), LockResult::Acquired);
    }

    #[test]
    fn exclusive_excludes_shared() {
        let mgr = LockManager::new();
        assert_eq!(mgr.lock_shared(1, 0, b"k", None), LockResult::Acquired);
        assert_eq!(
            mgr.lock_exclusive(2, 0, b"k", Some(Duration::ZERO)),
            LockResult::TimedOut
        );
    }

    #[test]
    fn reacquiring_own_lock_reports_owned() {
        let mgr = LockManager::new();
        mgr.lock_shared(1, 0, b"k", None);
        assert_eq!(mgr.lock_shared(1, 0, b"k", None), LockResult::OwnedShared);
    }

    #[test]
    fn upgradable_promotes_to_exclusive() {
        let mgr = LockManager::new();
        assert_eq!(mgr.lock_upgradable(1, 0, b"k", None), LockResult::Acquired);
        assert_eq!(mgr.lock_exclusive(1, 0, b"k", None), LockResult::Upgraded);
    }

    #[test]
    fn unlock_releases_for_others() {
        let mgr = LockManager::new();
        mgr.lock_exclusive(1, 0, b"k", None);
        mgr.unlock(1, 0, b"k");
        assert_eq!(mgr.lock_exclusive(2, 0, b"k", None), LockResult::Acquired);
    }

    #[test]
    fn direct_two_party_deadlock_is_detected() {
        let mgr = LockManager::new();
        assert_eq!(mgr.lock_exclusive(1, 0, b"a", None), LockResult::Acquired);
        assert_eq!(mgr.lock_exclusive(2, 0, b"b", None), LockResult::Acquired);
        // txn 1 waits on b (held by 2); txn 2 waits on a (held by 1): cycle.
        std::thread::scope(|s| {
            let h = s.spawn(|| mgr.lock_exclusive(1, 0, b"b", Some(Duration::from_millis(500))));
            std::thread::sleep(Duration::from_millis(20));
            let r2 = mgr.lock_exclusive(2, 0, b"a", Some(Duration::from_millis(500)));
            let r1 = h.join().unwrap();
            assert!(matches!(r1, LockResult::Deadlock(_)) || matches!(r2, LockResult::Deadlock(_)));
        });
    }
}
