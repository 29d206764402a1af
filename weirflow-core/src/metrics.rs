//! Metric scope of one task execution attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

/// Counters published under one task's metric scope.
///
/// The group closes exactly once, as the very last step of task teardown, so
/// observers see the task's final state before its metrics disappear.
#[derive(Debug)]
pub struct TaskMetricGroup {
    scope: String,
    num_records_in: AtomicU64,
    num_records_out: AtomicU64,
    num_bytes_in: AtomicU64,
    num_bytes_out: AtomicU64,
    closed: AtomicBool,
}

impl TaskMetricGroup {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            num_records_in: AtomicU64::new(0),
            num_records_out: AtomicU64::new(0),
            num_bytes_in: AtomicU64::new(0),
            num_bytes_out: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn add_records_in(&self, count: u64) {
        self.num_records_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_records_out(&self, count: u64) {
        self.num_records_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, count: u64) {
        self.num_bytes_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, count: u64) {
        self.num_bytes_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn records_in(&self) -> u64 {
        self.num_records_in.load(Ordering::Relaxed)
    }

    pub fn records_out(&self) -> u64 {
        self.num_records_out.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.num_bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.num_bytes_out.load(Ordering::Relaxed)
    }

    /// Unregister the group. Returns true on the first call only.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            debug!(scope = %self.scope, "closed task metric group");
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
