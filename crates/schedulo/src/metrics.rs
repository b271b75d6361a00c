use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Metrics is a rolling ops/second observation: a single counter against the
/// moment it was created. The input-side rate drives adaptive batching; the
/// output side is observability only.
#[derive(Debug)]
pub struct Metrics {
    ops: AtomicI64,
    start: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ops: AtomicI64::new(0),
            start: Instant::now(),
        }
    }

    pub fn op(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ops(&self) -> i64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Observed operations per second since construction.
    pub fn op_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.ops() as f64 / elapsed.max(f64::EPSILON)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
