use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide count of uncaught critical errors.
#[derive(Debug)]
pub struct ExceptionBudget {
    count: AtomicU32,
    threshold: u32,
}

impl ExceptionBudget {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Count one error. Returns the new total and whether the budget is spent.
    pub fn record(&self) -> (u32, bool) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        (count, count >= self.threshold)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_exhausted(&self) -> bool {
        self.count() >= self.threshold
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}
