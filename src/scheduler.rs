//! Explicit runtime context, replacing the `Scheduler.daemon()` singleton
//! described in `spec.md` §9 Design Notes.
//!
//! A [`RuntimeContext`] owns a small fixed worker pool for background engine
//! tasks (checkpoint, redo fsync, pending-commit release, snapshot writing,
//! trash drainage) plus a delay queue for fixed-time actions such as lock
//! wait timeouts. It is created once per [`crate::Database`] and handed down
//! to every component that needs to do background work, rather than reached
//! via a global.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<Vec<Job>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// A small fixed-size thread pool for background engine work.
///
/// Modeled after the teacher's habit of handing background coordination off
/// to dedicated threads synchronized with `std::sync::mpsc` channels
/// (`CommitUnit`, `WriteAlloc`), generalized into a reusable pool so the
/// checkpointer, redo-log fsync thread, and trash drainer don't each need to
/// hand-roll their own thread.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads.max(1) {
            let shared = shared.clone();
            handles.push(thread::spawn(move || worker_loop(shared)));
        }
        Self { shared, handles }
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push(Box::new(job));
        self.shared.cond.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared.cond.wait(queue).unwrap();
            }
        };
        if let Some(job) = job {
            job();
        }
    }
}

struct Timer {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Timer {}
impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

struct DelayShared {
    heap: Mutex<BinaryHeap<Reverse<Timer>>>,
    cond: Condvar,
    shutdown: AtomicBool,
    seq: std::sync::atomic::AtomicU64,
}

/// A delay-queue scheduler for fixed-time actions (lock timeouts,
/// reconnection backoff), per `spec.md` §5 Scheduling.
pub struct DelayQueue {
    shared: Arc<DelayShared>,
    handle: Option<JoinHandle<()>>,
}

impl DelayQueue {
    pub fn new() -> Self {
        let shared = Arc::new(DelayShared {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: std::sync::atomic::AtomicU64::new(0),
        });
        let thread_shared = shared.clone();
        let handle = thread::spawn(move || delay_loop(thread_shared));
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Schedule `job` to run no sooner than `delay` from now.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, job: F) {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let timer = Timer {
            at: Instant::now() + delay,
            seq,
            job: Box::new(job),
        };
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(Reverse(timer));
        self.shared.cond.notify_one();
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn delay_loop(shared: Arc<DelayShared>) {
    loop {
        let mut heap = shared.heap.lock().unwrap();
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match heap.peek() {
                None => {
                    heap = shared.cond.wait(heap).unwrap();
                }
                Some(Reverse(top)) => {
                    let now = Instant::now();
                    if top.at <= now {
                        break;
                    }
                    let (new_heap, timeout) = shared.cond.wait_timeout(heap, top.at - now).unwrap();
                    heap = new_heap;
                    let _ = timeout;
                }
            }
        }
        if let Some(Reverse(timer)) = heap.pop() {
            drop(heap);
            (timer.job)();
        }
    }
}

/// Background engine context, owned by [`crate::Database`] and threaded
/// through to every component that schedules work.
pub struct RuntimeContext {
    pub pool: WorkerPool,
    pub delays: DelayQueue,
}

impl RuntimeContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pool: WorkerPool::new(4),
            delays: DelayQueue::new(),
        })
    }
}

/// A lightweight one-shot completion channel, used the way the teacher uses
/// `mpsc` to signal a background allocation or hole-punch completion back to
/// the owning transaction.
pub fn one_shot<T: Send + 'static>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn worker_pool_runs_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn delay_queue_orders_by_time() {
        let dq = DelayQueue::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        dq.schedule(Duration::from_millis(30), move || tx2.send(2).unwrap());
        dq.schedule(Duration::from_millis(5), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    }
}
