// src/timer.rs
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    fd: i32,
    deadline: Instant,
}

/// Idle-connection timer: a dense min-heap of deadlines beside an
/// `fd -> heap position` map, so every operation is addressable by fd.
/// At most one entry per fd; mutations are O(log n), peek is O(1).
///
/// Expiry reports bare fds; the reactor resolves fd -> connection when it
/// evicts, so the timer never holds a reference into the connection table.
pub struct Timer {
    heap: Vec<Entry>,
    index: HashMap<i32, usize>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::with_capacity(32)
    }
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { heap: Vec::with_capacity(n), index: HashMap::with_capacity(n) }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, fd: i32) -> bool {
        self.index.contains_key(&fd)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Arm (or re-arm) the entry for `fd` at `now + timeout`.
    pub fn add_event(&mut self, fd: i32, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        match self.index.get(&fd) {
            Some(&i) => {
                self.heap[i].deadline = deadline;
                self.sift(i);
            }
            None => {
                let i = self.heap.len();
                self.heap.push(Entry { fd, deadline });
                self.index.insert(fd, i);
                self.sift_up(i);
            }
        }
    }

    /// Refresh the deadline for `fd`. Absence means the entry raced a
    /// close; arming fresh is harmless either way.
    pub fn adjust_event(&mut self, fd: i32, timeout: Duration) {
        self.add_event(fd, timeout);
    }

    /// Drop the entry for `fd`, if armed.
    pub fn pop_event(&mut self, fd: i32) -> bool {
        match self.index.get(&fd) {
            Some(&i) => {
                self.remove_at(i);
                true
            }
            None => false,
        }
    }

    /// Pop every entry whose deadline has passed, returning their fds in
    /// expiry order.
    pub fn tick(&mut self) -> Vec<i32> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(top) = self.heap.first() {
            if top.deadline > now {
                break;
            }
            expired.push(top.fd);
            self.remove_at(0);
        }
        expired
    }

    /// Run [`tick`](Self::tick), then report the milliseconds until the
    /// next deadline (clamped at zero), or -1 when nothing is armed.
    pub fn next_tick(&mut self) -> (Vec<i32>, i64) {
        let expired = self.tick();
        let ms = match self.heap.first() {
            None => -1,
            Some(top) => top
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as i64,
        };
        (expired, ms)
    }

    fn remove_at(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        self.swap_entries(i, last);
        let gone = self.heap.pop().expect("non-empty heap");
        self.index.remove(&gone.fd);
        if i < self.heap.len() {
            self.sift(i);
        }
    }

    fn sift(&mut self, i: usize) {
        if self.sift_down(i) == i {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let up = (i - 1) / 2;
            if self.heap[i].deadline < self.heap[up].deadline {
                self.swap_entries(i, up);
                i = up;
            } else {
                break;
            }
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) -> usize {
        let n = self.heap.len();
        loop {
            let mut child = i * 2 + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].deadline < self.heap[child].deadline {
                child += 1;
            }
            if self.heap[child].deadline < self.heap[i].deadline {
                self.swap_entries(i, child);
                i = child;
            } else {
                break;
            }
        }
        i
    }

    fn swap_entries(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        *self.index.get_mut(&self.heap[i].fd).expect("indexed fd") = i;
        *self.index.get_mut(&self.heap[j].fd).expect("indexed fd") = j;
    }
}
