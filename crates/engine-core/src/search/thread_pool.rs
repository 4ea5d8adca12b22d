//! Worker pool for playouts and parallel tree maintenance.
//!
//! Workers are long-lived OS threads, each with a Condvar-guarded task
//! slot. `perform_task_with_threads` hands the same task to every worker
//! plus the caller (as thread 0) and joins through a countdown latch, so a
//! task's borrows stay valid for exactly the duration of the call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::error;

/// A borrowed task pointer smuggled into long-lived workers. Sound because
/// the dispatching call blocks on the latch until every worker has finished
/// running it.
#[derive(Clone, Copy)]
struct TaskRef(*const (dyn Fn(usize) + Sync));

unsafe impl Send for TaskRef {}

/// Countdown latch: the dispatching thread waits until all workers report.
pub struct TaskLatch {
    count: Mutex<i64>,
    condvar: Condvar,
}

impl TaskLatch {
    pub fn new() -> TaskLatch {
        TaskLatch {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn add(&self, n: i64) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        if *count <= 0 {
            self.condvar.notify_all();
        }
    }

    pub fn wait_until_zero(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.condvar.wait(count).unwrap();
        }
    }
}

/// Decrements the latch even if the task panics; the panic then propagates
/// and kills the worker, which the pool respawns lazily.
struct LatchGuard<'a>(&'a TaskLatch);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.add(-1);
    }
}

struct WorkerState {
    task: Option<TaskRef>,
    exit: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    condvar: Condvar,
    latch: Arc<TaskLatch>,
    panicked: AtomicBool,
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(thread_idx: usize, latch: Arc<TaskLatch>) -> Worker {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                task: None,
                exit: false,
            }),
            condvar: Condvar::new(),
            latch,
            panicked: AtomicBool::new(false),
        });
        let shared_clone = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("search-worker-{thread_idx}"))
            .spawn(move || worker_loop(shared_clone, thread_idx))
            .expect("failed to spawn search worker thread");
        Worker {
            shared,
            handle: Some(handle),
        }
    }

    fn schedule(&self, task: TaskRef) {
        let mut state = self.shared.state.lock().unwrap();
        debug_assert!(state.task.is_none());
        state.task = Some(task);
        self.shared.condvar.notify_one();
    }

    fn is_dead(&self) -> bool {
        self.shared.panicked.load(Ordering::Acquire)
            || self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.exit = true;
            self.shared.condvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>, thread_idx: usize) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            while state.task.is_none() && !state.exit {
                state = shared.condvar.wait(state).unwrap();
            }
            if state.exit {
                return;
            }
            state.task.take().unwrap()
        };

        let guard = LatchGuard(&shared.latch);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            (*task.0)(thread_idx);
        }));
        drop(guard);
        if let Err(payload) = result {
            shared.panicked.store(true, Ordering::Release);
            error!("search worker thread {thread_idx} failed");
            std::panic::resume_unwind(payload);
        }
    }
}

pub struct SearchThreadPool {
    workers: Vec<Worker>,
    latch: Arc<TaskLatch>,
}

impl SearchThreadPool {
    pub fn new() -> SearchThreadPool {
        SearchThreadPool {
            workers: Vec::new(),
            latch: Arc::new(TaskLatch::new()),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Ensure there are exactly `num_additional_threads` live workers,
    /// respawning any that died to a panic.
    pub fn spawn_threads_if_needed(&mut self, num_additional_threads: usize) {
        let any_dead = self.workers.iter().any(|w| w.is_dead());
        if any_dead || self.workers.len() != num_additional_threads {
            self.workers.clear();
            for i in 0..num_additional_threads {
                self.workers.push(Worker::new(i + 1, Arc::clone(&self.latch)));
            }
        }
    }

    /// Whether any worker died to a panic. Dead workers are respawned on
    /// the next `spawn_threads_if_needed`.
    pub fn any_worker_panicked(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.shared.panicked.load(Ordering::Acquire))
    }

    /// Run `task` on every worker (as thread indices 1..) and on the
    /// calling thread (as thread 0), returning when all are done.
    pub fn perform_task_with_threads(&self, task: &(dyn Fn(usize) + Sync)) {
        if self.workers.is_empty() {
            task(0);
            return;
        }
        self.latch.add(self.workers.len() as i64);
        // SAFETY: erasing the borrow's lifetime is sound because this call
        // blocks on the latch until every worker has finished running the
        // task, per the module-level doc comment.
        let task_ref = TaskRef(unsafe { std::mem::transmute(task) });
        for worker in &self.workers {
            worker.schedule(task_ref);
        }
        task(0);
        self.latch.wait_until_zero();
    }
}

impl Default for SearchThreadPool {
    fn default() -> SearchThreadPool {
        SearchThreadPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_threaded_fallback() {
        let pool = SearchThreadPool::new();
        let count = AtomicUsize::new(0);
        pool.perform_task_with_threads(&|idx| {
            assert_eq!(idx, 0);
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fan_out_runs_on_all_threads() {
        let mut pool = SearchThreadPool::new();
        pool.spawn_threads_if_needed(3);
        let mask = AtomicUsize::new(0);
        pool.perform_task_with_threads(&|idx| {
            mask.fetch_or(1 << idx, Ordering::Relaxed);
        });
        assert_eq!(mask.load(Ordering::Relaxed), 0b1111);
        // The pool is reusable.
        let count = AtomicUsize::new(0);
        pool.perform_task_with_threads(&|_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_borrowed_state_visible_to_workers() {
        let mut pool = SearchThreadPool::new();
        pool.spawn_threads_if_needed(2);
        let data = vec![1u64, 2, 3];
        let total = AtomicUsize::new(0);
        pool.perform_task_with_threads(&|_| {
            let s: u64 = data.iter().sum();
            total.fetch_add(s as usize, Ordering::Relaxed);
        });
        assert_eq!(total.load(Ordering::Relaxed), 18);
    }

    #[test]
    fn test_respawn_after_resize() {
        let mut pool = SearchThreadPool::new();
        pool.spawn_threads_if_needed(1);
        assert_eq!(pool.num_workers(), 1);
        pool.spawn_threads_if_needed(4);
        assert_eq!(pool.num_workers(), 4);
        pool.spawn_threads_if_needed(4);
        assert_eq!(pool.num_workers(), 4);
    }
}
