use parking_lot::{Condvar, Mutex};

/// Counting semaphore: `release` adds a permit, `acquire` blocks until one is
/// available and consumes it.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    #[cfg(test)]
    pub(crate) fn acquire_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    pub(crate) fn release(&self) {
        let mut permits = self.permits.lock();
        *permits = permits.saturating_add(1);
        self.available.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        *self.permits.lock()
    }
}
