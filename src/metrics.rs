//! Backend request/failure counters shared by every connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter, safe to bump from any task.
#[derive(Debug, Default)]
pub struct SimpleCounter {
    name: &'static str,
    value: AtomicU64,
}

impl SimpleCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Add one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value. Only used for reporting; handlers never read counters.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// The two counters every handler reports into.
#[derive(Debug, Clone)]
pub struct BackendMetrics {
    pub requests: Arc<SimpleCounter>,
    pub failures: Arc<SimpleCounter>,
}

impl BackendMetrics {
    pub fn new(requests: Arc<SimpleCounter>, failures: Arc<SimpleCounter>) -> Self {
        Self { requests, failures }
    }
}

impl Default for BackendMetrics {
    fn default() -> Self {
        Self {
            requests: Arc::new(SimpleCounter::new("backend_requests_total")),
            failures: Arc::new(SimpleCounter::new("backend_failures_total")),
        }
    }
}
