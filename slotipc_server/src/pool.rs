//! Fixed-size worker pools over a FIFO queue of slot indices.
//!
//! The dispatcher pushes slot indices; workers pop them and run the pool's
//! handler. Shutdown comes in two flavors: drain (the queue empties before
//! workers exit) and immediate (the queue is swapped out and its length
//! reported as the discarded count).

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};

use crate::config::ShutdownMode;

struct PoolShared {
    queue: Mutex<VecDeque<usize>>,
    available: Condvar,
    stop: AtomicBool,
}

/// A pool of worker threads consuming slot indices in FIFO order.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `threads` workers named `{name}-{i}`, each running `handler`
    /// on every dequeued slot index.
    pub fn new<F>(name: &str, threads: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let worker = Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&shared, &*handler))?;
            workers.push(worker);
        }

        Ok(Self { shared, workers })
    }

    /// Queues a slot index. Returns false once the pool is stopping.
    pub fn submit(&self, slot_index: usize) -> bool {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if self.shared.stop.load(Ordering::Acquire) {
                return false;
            }
            queue.push_back(slot_index);
        }
        self.shared.available.notify_one();
        true
    }

    /// Number of queued (not yet started) tasks.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Stops the pool and joins every worker. Returns how many queued
    /// tasks were discarded (always 0 for drain). Idempotent.
    pub fn shutdown(&mut self, mode: ShutdownMode) -> usize {
        let discarded;
        {
            // Setting stop under the queue lock keeps it ordered against
            // the condvar predicate check in worker_loop.
            let mut queue = self.shared.queue.lock().unwrap();
            if self.shared.stop.swap(true, Ordering::AcqRel) {
                return 0;
            }
            discarded = match mode {
                ShutdownMode::Drain => 0,
                ShutdownMode::Immediate => std::mem::take(&mut *queue).len(),
            };
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        discarded
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Drain);
    }
}

fn worker_loop(shared: &PoolShared, handler: &(dyn Fn(usize) + Send + Sync)) {
    loop {
        let slot_index = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(idx) = queue.pop_front() {
                    break idx;
                }
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };
        handler(slot_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn drain_finishes_every_queued_task() {
        let done = Arc::new(AtomicUsize::new(0));
        let done_in_pool = Arc::clone(&done);
        let mut pool = ThreadPool::new("drain-test", 2, move |_| {
            std::thread::sleep(Duration::from_millis(5));
            done_in_pool.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for i in 0..20 {
            assert!(pool.submit(i));
        }
        let discarded = pool.shutdown(ShutdownMode::Drain);
        assert_eq!(discarded, 0);
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn immediate_discards_the_queue() {
        let gate = Arc::new(AtomicBool::new(false));
        let gate_in_pool = Arc::clone(&gate);
        let mut pool = ThreadPool::new("imm-test", 1, move |_| {
            while !gate_in_pool.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        for i in 0..8 {
            assert!(pool.submit(i));
        }
        // Let the single worker pick up the first task; the other seven
        // stay queued behind the gate.
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.pending_len(), 7);

        // Release the worker only after shutdown swapped the queue out,
        // so the discarded count is deterministic.
        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            gate.store(true, Ordering::SeqCst);
        });
        let discarded = pool.shutdown(ShutdownMode::Immediate);
        opener.join().unwrap();
        assert_eq!(discarded, 7);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut pool = ThreadPool::new("stop-test", 1, |_| {}).unwrap();
        assert!(pool.submit(0));
        pool.shutdown(ShutdownMode::Drain);
        assert!(!pool.submit(1));
        // A second shutdown is a no-op.
        assert_eq!(pool.shutdown(ShutdownMode::Immediate), 0);
    }
}
