//! Unbounded FIFO of graded cluster events, filled by the processor in
//! per-batch bursts and drained by the species writer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffers::shutdown::StopGuard;
use crate::processing::cluster::SpeciesHit;

pub struct SpeciesQueue {
    items: Mutex<VecDeque<SpeciesHit>>,
    ready: Condvar,
    stop: AtomicBool,
}

impl SpeciesQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, VecDeque<SpeciesHit>> {
        self.items.lock()
    }

    pub fn wait(&self, items: &mut MutexGuard<'_, VecDeque<SpeciesHit>>) {
        self.ready.wait(items);
    }

    pub fn notify_one(&self) {
        self.ready.notify_one();
    }
}

impl StopGuard for SpeciesQueue {
    fn request_stop(&self) {
        // flag raised under the lock: a worker between its wait predicate
        // and its wait cannot miss the notify that follows
        let _items = self.items.lock();
        self.stop.store(true, Ordering::Release);
    }

    fn notify_all(&self) {
        self.ready.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}
