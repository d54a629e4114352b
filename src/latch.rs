//! Latch & LatchCondition (C4, `spec.md` §4.4).
//!
//! A `Latch` is a short-duration shared/exclusive primitive, distinct from a
//! [`crate::lock::Lock`], which is a named, transaction-scoped entity over an
//! (index, key) pair. `LatchCondition` layers a fair, spurious-wakeup-free
//! wait queue on top, used while a caller already holds a latch exclusively
//! — this is exactly how the lock manager's per-shard upgradable and
//! shared/exclusive wait queues are built (`spec.md` §4.5).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct LatchState {
    readers: u32,
    writer: bool,
}

/// A shared/exclusive latch. Cheap to acquire and intended to be held only
/// for the duration of a single page or cache operation.
pub struct Latch {
    inner: Mutex<LatchState>,
    cond: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LatchState {
                readers: 0,
                writer: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn acquire_shared(&self) {
        let mut state = self.inner.lock().unwrap();
        while state.writer {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub fn try_acquire_shared(&self) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn release_shared(&self) {
        let mut state = self.inner.lock().unwrap();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn acquire_exclusive(&self) {
        let mut state = self.inner.lock().unwrap();
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    pub fn release_exclusive(&self) {
        let mut state = self.inner.lock().unwrap();
        debug_assert!(state.writer);
        state.writer = false;
        self.cond.notify_all();
    }

    /// Downgrade an exclusive hold to shared, atomically with respect to
    /// other waiters.
    pub fn downgrade(&self) {
        let mut state = self.inner.lock().unwrap();
        debug_assert!(state.writer);
        state.writer = false;
        state.readers += 1;
        self.cond.notify_all();
    }
}

/// RAII guard for an exclusively held latch, usable with [`LatchCondition`].
pub struct ExclusiveGuard<'a> {
    latch: &'a Latch,
    held: bool,
}

impl<'a> ExclusiveGuard<'a> {
    pub fn new(latch: &'a Latch) -> Self {
        latch.acquire_exclusive();
        Self { latch, held: true }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.latch.release_exclusive();
        }
    }
}

/// Why an [`LatchCondition::await_signal`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitResult {
    Signaled,
    TimedOut,
    Interrupted,
}

enum Entry<T> {
    Thread {
        park: Arc<ParkSlot>,
        tag: Option<T>,
    },
    Continuation(Box<dyn FnOnce() + Send>),
}

struct ParkSlot {
    state: Mutex<ParkState>,
    cond: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParkState {
    Waiting,
    Signaled,
    Interrupted,
}

/// A fair FIFO wait queue with tagging and continuation support, used while
/// a [`Latch`] is held exclusively (`spec.md` §4.4).
///
/// Unlike a generic condition variable, a waiter only ever returns because it
/// was signalled, interrupted, or its deadline passed — never spuriously.
pub struct LatchCondition<T> {
    queue: Mutex<VecDeque<Entry<T>>>,
}

impl<T> Default for LatchCondition<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatchCondition<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Release `guard`'s exclusive hold on `latch`, block until signalled,
    /// interrupted, or `deadline` passes, then reacquire the latch
    /// exclusively before returning.
    pub fn await_signal(
        &self,
        guard: ExclusiveGuard<'_>,
        tag: Option<T>,
        deadline: Option<Instant>,
    ) -> (ExclusiveGuard<'_>, AwaitResult) {
        let latch = guard.latch;
        let park = Arc::new(ParkSlot {
            state: Mutex::new(ParkState::Waiting),
            cond: Condvar::new(),
        });
        {
            let mut q = self.queue.lock().unwrap();
            q.push_back(Entry::Thread {
                park: park.clone(),
                tag,
            });
        }
        // Drop the exclusive hold while we wait.
        drop(guard);

        let result = {
            let mut state = park.state.lock().unwrap();
            loop {
                match *state {
                    ParkState::Signaled => break AwaitResult::Signaled,
                    ParkState::Interrupted => break AwaitResult::Interrupted,
                    ParkState::Waiting => {}
                }
                match deadline {
                    None => state = park.cond.wait(state).unwrap(),
                    Some(dl) => {
                        let now = Instant::now();
                        if now >= dl {
                            break AwaitResult::TimedOut;
                        }
                        let (s, _) = park.cond.wait_timeout(state, dl - now).unwrap();
                        state = s;
                    }
                }
            }
        };

        (ExclusiveGuard::new(latch), result)
    }

    /// Like [`Self::await_signal`], but joins the queue at the head instead
    /// of the tail, giving this waiter priority over ones already parked.
    pub fn priority_await(
        &self,
        guard: ExclusiveGuard<'_>,
        tag: Option<T>,
        deadline: Option<Instant>,
    ) -> (ExclusiveGuard<'_>, AwaitResult) {
        let latch = guard.latch;
        let park = Arc::new(ParkSlot {
            state: Mutex::new(ParkState::Waiting),
            cond: Condvar::new(),
        });
        {
            let mut q = self.queue.lock().unwrap();
            q.push_front(Entry::Thread {
                park: park.clone(),
                tag,
            });
        }
        drop(guard);
        let result = {
            let mut state = park.state.lock().unwrap();
            loop {
                match *state {
                    ParkState::Signaled => break AwaitResult::Signaled,
                    ParkState::Interrupted => break AwaitResult::Interrupted,
                    ParkState::Waiting => {}
                }
                match deadline {
                    None => state = park.cond.wait(state).unwrap(),
                    Some(dl) => {
                        let now = Instant::now();
                        if now >= dl {
                            break AwaitResult::TimedOut;
                        }
                        let (s, _) = park.cond.wait_timeout(state, dl - now).unwrap();
                        state = s;
                    }
                }
            }
        };
        (ExclusiveGuard::new(latch), result)
    }

    /// Enqueue a continuation that runs on the *signalling* thread, while it
    /// still holds the latch exclusively — an ownership transfer rather than
    /// a wakeup.
    pub fn upon_signal<F: FnOnce() + Send + 'static>(&self, continuation: F) {
        let mut q = self.queue.lock().unwrap();
        q.push_back(Entry::Continuation(Box::new(continuation)));
    }

    fn wake_entry(entry: Entry<T>) {
        match entry {
            Entry::Thread { park, .. } => {
                let mut state = park.state.lock().unwrap();
                *state = ParkState::Signaled;
                park.cond.notify_one();
            }
            Entry::Continuation(f) => f(),
        }
    }

    /// Wake the head waiter (thread or continuation).
    pub fn signal(&self) {
        let head = self.queue.lock().unwrap().pop_front();
        if let Some(entry) = head {
            Self::wake_entry(entry);
        }
    }

    /// Drain and wake every waiter.
    pub fn signal_all(&self) {
        let drained: Vec<_> = self.queue.lock().unwrap().drain(..).collect();
        for entry in drained {
            Self::wake_entry(entry);
        }
    }

    /// Interrupt the head waiter instead of signalling it normally.
    pub fn interrupt_head(&self) {
        let head = self.queue.lock().unwrap().pop_front();
        if let Some(Entry::Thread { park, .. }) = head {
            let mut state = park.state.lock().unwrap();
            *state = ParkState::Interrupted;
            park.cond.notify_one();
        }
    }
}

impl<T: PartialEq + Copy> LatchCondition<T> {
    /// Wake the head waiter only if it carries `tag`, giving priority-style
    /// filtering (e.g. waking only upgradable-class waiters).
    pub fn signal_tagged(&self, tag: T) {
        let mut q = self.queue.lock().unwrap();
        let wake = matches!(q.front(), Some(Entry::Thread { tag: Some(t), .. }) if *t == tag);
        if wake {
            let entry = q.pop_front().unwrap();
            drop(q);
            Self::wake_entry(entry);
        }
    }

    /// Wake a contiguous run of head waiters that all carry `tag` — used by
    /// the lock manager to wake every shared waiter queued before the next
    /// upgradable/exclusive waiter.
    pub fn signal_shared(&self, tag: T) {
        let mut woken = Vec::new();
        {
            let mut q = self.queue.lock().unwrap();
            while matches!(q.front(), Some(Entry::Thread { tag: Some(t), .. }) if *t == tag) {
                woken.push(q.pop_front().unwrap());
            }
        }
        for entry in woken {
            Self::wake_entry(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn shared_latches_do_not_block_each_other() {
        let latch = Latch::new();
        latch.acquire_shared();
        assert!(latch.try_acquire_shared());
        latch.release_shared();
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn exclusive_excludes_shared() {
        let latch = Latch::new();
        latch.acquire_exclusive();
        assert!(!latch.try_acquire_shared());
        latch.release_exclusive();
        assert!(latch.try_acquire_shared());
        latch.release_shared();
    }

    #[test]
    fn condition_signal_wakes_single_waiter() {
        let latch = StdArc::new(Latch::new());
        let cond: StdArc<LatchCondition<()>> = StdArc::new(LatchCondition::new());

        let l2 = latch.clone();
        let c2 = cond.clone();
        let handle = thread::spawn(move || {
            let guard = ExclusiveGuard::new(&l2);
            let (_guard, result) = c2.await_signal(guard, None, None);
            result
        });

        // Give the waiter a moment to enqueue.
        thread::sleep(Duration::from_millis(50));
        {
            let _guard = ExclusiveGuard::new(&latch);
            cond.signal();
        }
        assert_eq!(handle.join().unwrap(), AwaitResult::Signaled);
    }

    #[test]
    fn timeout_fires_without_signal() {
        let latch = Latch::new();
        let cond: LatchCondition<()> = LatchCondition::new();
        let guard = ExclusiveGuard::new(&latch);
        let (_guard, result) =
            cond.await_signal(guard, None, Some(Instant::now() + Duration::from_millis(20)));
        assert_eq!(result, AwaitResult::TimedOut);
    }
}
