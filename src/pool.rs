// src/pool.rs
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Fixed-size worker pool over a mutex+condvar FIFO.
///
/// Workers pop, unlock, invoke, relock; they park on the condvar when the
/// queue is empty and exit once `closed` is set. Dropping the pool closes
/// the queue, wakes everyone, and joins the threads; tasks already queued
/// still run.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    count: usize,
}

impl ThreadPool {
    /// Spawn `count` workers; 0 means one per CPU.
    pub fn new(count: usize) -> Self {
        let count = if count == 0 { num_cpus::get() } else { count };
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState { tasks: VecDeque::new(), closed: false }),
            cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("minuet-worker-{i}"))
                .spawn(move || worker_loop(&shared))
                .expect("spawn worker thread");
            workers.push(handle);
        }

        Self { shared, workers, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn add_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.cond.wait(state).unwrap();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
        }
        self.shared.cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
