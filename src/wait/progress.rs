use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Receives completion counts while a wait is in progress.
pub trait ProgressSink: Send + Sync {
    fn set_total(&self, total: usize);
    fn inc(&self, completed: usize);
    fn close(&self);
}

/// Progress reporter that emits tracing events instead of drawing a bar.
#[derive(Debug, Default)]
pub struct TracingProgress {
    total: AtomicUsize,
    completed: AtomicUsize,
    closed: AtomicBool,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(completed, total)` as last reported.
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.completed.load(Ordering::Acquire),
            self.total.load(Ordering::Acquire),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ProgressSink for TracingProgress {
    fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Release);
    }

    fn inc(&self, completed: usize) {
        if completed == 0 {
            return;
        }
        let now = self.completed.fetch_add(completed, Ordering::AcqRel) + completed;
        tracing::debug!(completed = now, total = self.total.load(Ordering::Acquire), "Progress");
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let (completed, total) = self.snapshot();
            tracing::info!(completed, total, "Progress closed");
        }
    }
}
