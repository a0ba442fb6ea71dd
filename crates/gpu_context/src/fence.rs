use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether previously recorded GPU work has completed.
///
/// A fence may be shared by any number of resources. `set` is called each
/// time a read lock captures the fence, telling the owner that the fence
/// guards real work and must be signaled at the end of the frame.
pub trait Fence: Send + Sync {
    fn set(&self) {}
    fn has_passed(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct ManualFence {
    set: AtomicBool,
    passed: AtomicBool,
}

impl ManualFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.passed.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Relaxed)
    }
}

impl Fence for ManualFence {
    fn set(&self) {
        self.set.store(true, Ordering::Relaxed);
    }

    fn has_passed(&self) -> bool {
        self.passed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn manual_fence_passes_only_after_signal() {
        let fence = Arc::new(ManualFence::new());
        let shared: Arc<dyn Fence> = fence.clone();
        shared.set();
        assert!(fence.is_set());
        assert!(!shared.has_passed());
        fence.signal();
        assert!(shared.has_passed());
    }
}
