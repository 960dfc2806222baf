use std::sync::atomic::{AtomicBool, Ordering};

/// A spin lock around a flow's framing and transport write.
///
/// Sections guarded by this are a framing pass over the outbound batch plus one non-blocking
///  transport write, i.e. on the order of microseconds. Waiting threads spin and yield instead
///  of parking. Code that may block or await must not run inside a section.
pub struct CriticalSection {
    locked: AtomicBool,
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalSection {
    pub const fn new() -> CriticalSection {
        CriticalSection {
            locked: AtomicBool::new(false),
        }
    }

    pub fn enter(&self) -> CriticalSectionGuard<'_> {
        while self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            while self.locked.load(Ordering::Relaxed) {
                std::thread::yield_now();
            }
        }
        CriticalSectionGuard { locked: &self.locked }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct CriticalSectionGuard<'a> {
    locked: &'a AtomicBool,
}

impl Drop for CriticalSectionGuard<'_> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}
