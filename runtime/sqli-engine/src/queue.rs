use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::envelope::Request;
use crate::sync::Semaphore;

struct DualBuffer {
    lists: [Vec<Request>; 2],
    active: usize,
}

impl DualBuffer {
    fn swap_and_take(&mut self) -> Vec<Request> {
        let captured = self.active;
        self.active ^= 1;
        mem::take(&mut self.lists[captured])
    }
}

/// Cross-thread hand-off between the host thread and one worker.
///
/// Posts land in the active list under a short lock. The worker waits on the
/// semaphore, flips the active index and walks away with the captured list,
/// so producers never wait on a batch being processed. Several posts between
/// two wake-ups come back as one batch; a later wake-up may then find an
/// empty list.
pub struct RequestQueue {
    buffers: Mutex<DualBuffer>,
    signal: Semaphore,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(DualBuffer {
                lists: [Vec::new(), Vec::new()],
                active: 0,
            }),
            signal: Semaphore::new(0),
        }
    }

    pub fn post(&self, request: Request) {
        {
            let mut buffers = self.buffers.lock();
            let active = buffers.active;
            buffers.lists[active].push(request);
        }
        self.signal.release();
    }

    /// Blocks for a signal, then claims everything posted so far.
    /// Returns `None` once `stop` is set.
    pub fn drain(&self, stop: &AtomicBool) -> Option<Vec<Request>> {
        self.signal.acquire();
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.buffers.lock().swap_and_take())
    }

    /// Releases one signal without posting, to unpark a waiting worker.
    pub fn wake(&self) {
        self.signal.release();
    }

    pub fn pending(&self) -> usize {
        let buffers = self.buffers.lock();
        buffers.lists[0].len() + buffers.lists[1].len()
    }

    /// Drops everything not yet drained and returns how many requests that was.
    pub fn clear(&self) -> usize {
        let mut buffers = self.buffers.lock();
        let dropped = buffers.lists[0].len() + buffers.lists[1].len();
        buffers.lists[0].clear();
        buffers.lists[1].clear();
        dropped
    }

    pub fn active_buffer(&self) -> usize {
        self.buffers.lock().active
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
