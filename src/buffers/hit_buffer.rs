//! hit_buffer.rs
//! Bounded FIFO buffer for raw pixel hits, shared between the driver
//! callback (producer) and exactly one drainer. Appends past capacity are
//! truncated and the overflow count surfaced to the caller; drains copy
//! from the head and compact the remainder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffers::shutdown::StopGuard;
use crate::settings::MAX_BUFF_EL;

/// The buffer contents. Callers obtain this through [`HitBuffer::lock`]
/// and perform `add_elements`/`copy_clear` while holding the guard.
pub struct HitStore<T> {
    slots: Vec<T>,
    capacity: usize,
}

impl<T: Copy> HitStore<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Appends as many elements of `src` as fit, truncating the rest.
    /// Returns `(total, discarded)`: the element count after the append
    /// and how many were refused due to overflow.
    pub fn add_elements(&mut self, src: &[T]) -> (usize, usize) {
        let room = self.capacity - self.slots.len();
        let taken = src.len().min(room);
        self.slots.extend_from_slice(&src[..taken]);
        (self.slots.len(), src.len() - taken)
    }

    /// Copies up to `max_elements` from the head into `dst` (replacing its
    /// contents) and removes them here, compacting whatever is left.
    /// Returns the number of elements copied.
    pub fn copy_clear(&mut self, dst: &mut Vec<T>, max_elements: usize) -> usize {
        let copied = self.slots.len().min(max_elements);
        dst.clear();
        dst.extend_from_slice(&self.slots[..copied]);
        self.slots.drain(..copied);
        copied
    }
}

/// Mutex/condvar guarded [`HitStore`] with a stop flag for shutdown.
pub struct HitBuffer<T> {
    store: Mutex<HitStore<T>>,
    ready: Condvar,
    stop: AtomicBool,
}

impl<T: Copy> HitBuffer<T> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUFF_EL)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: Mutex::new(HitStore::with_capacity(capacity)),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HitStore<T>> {
        self.store.lock()
    }

    /// Blocks on the condvar until notified. Spurious wakeups are the
    /// caller's problem, as is re-checking state after the wait.
    pub fn wait(&self, store: &mut MutexGuard<'_, HitStore<T>>) {
        self.ready.wait(store);
    }

    /// Bounded wait; returns `true` if the wait timed out.
    pub fn wait_for(&self, store: &mut MutexGuard<'_, HitStore<T>>, timeout: Duration) -> bool {
        self.ready.wait_for(store, timeout).timed_out()
    }

    pub fn notify_one(&self) {
        self.ready.notify_one();
    }
}

impl<T> StopGuard for HitBuffer<T> {
    fn request_stop(&self) {
        // flag raised under the lock: a worker between its stop check and
        // its wait cannot miss the notify that follows
        let _store = self.store.lock();
        self.stop.store(true, Ordering::Release);
    }

    fn notify_all(&self) {
        self.ready.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}
