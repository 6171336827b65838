use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Point in time view of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    /// Backend specific name of the underlying queue
    pub internal_name: String,
    /// Jobs waiting to be delivered
    pub queue: i64,
    /// Jobs currently executing
    pub active: i64,
    /// Jobs scheduled for later delivery
    pub delayed: i64,
}

/// Lock free counters behind a [`Stat`]. Snapshots are eventually consistent.
#[derive(Debug, Default)]
pub struct StatCounters {
    queue: AtomicI64,
    active: AtomicI64,
    delayed: AtomicI64,
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) {
        self.queue.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dequeued(&self) {
        self.queue.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn delayed(&self) {
        self.delayed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn undelayed(&self) {
        self.delayed.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst).max(0)
    }

    pub fn snapshot(&self, internal_name: &str) -> Stat {
        Stat {
            internal_name: internal_name.to_string(),
            queue: self.queue.load(Ordering::SeqCst).max(0),
            active: self.active(),
            delayed: self.delayed.load(Ordering::SeqCst).max(0),
        }
    }
}
