//! Cooperative worker shutdown: a stop flag raised on the channel the
//! worker sleeps on, a condvar broadcast to get it out of the wait, and
//! a join. Workers drain residual data after observing the flag.

use std::thread::JoinHandle;

/// Capability surface shared by every guarded channel. The shutdown
/// helper only needs to raise the stop flag and wake sleepers; workers
/// additionally poll `stop_requested` at their loop heads and inside
/// wait predicates.
pub trait StopGuard {
    fn request_stop(&self);
    fn notify_all(&self);
    fn stop_requested(&self) -> bool;
}

/// Stops and joins a worker that waits on `guard`.
///
/// The handle is taken out of the `Option`, so calling this twice (or on
/// a worker that never launched) is a no-op.
pub fn safe_finish(worker: &mut Option<JoinHandle<()>>, guard: &dyn StopGuard) {
    guard.request_stop();
    guard.notify_all();
    if let Some(handle) = worker.take() {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::HitBuffer;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn finishes_worker_blocked_on_condvar() {
        let buff: Arc<HitBuffer<u32>> = Arc::new(HitBuffer::new());
        let drained = Arc::new(AtomicU64::new(0));

        let worker = {
            let buff = buff.clone();
            let drained = drained.clone();
            thread::spawn(move || {
                let mut work = Vec::new();
                while !buff.stop_requested() {
                    let copied = {
                        let mut store = buff.lock();
                        if !buff.stop_requested() {
                            buff.wait(&mut store);
                        }
                        if store.is_empty() {
                            continue;
                        }
                        store.copy_clear(&mut work, 16)
                    };
                    drained.fetch_add(copied as u64, Ordering::Relaxed);
                }
                let copied = {
                    let mut store = buff.lock();
                    store.copy_clear(&mut work, 16)
                };
                drained.fetch_add(copied as u64, Ordering::Relaxed);
            })
        };

        {
            let mut store = buff.lock();
            store.add_elements(&[1, 2, 3]);
        }

        let mut handle = Some(worker);
        safe_finish(&mut handle, buff.as_ref());
        assert!(handle.is_none());
        // residual data was drained on the way out
        assert_eq!(drained.load(Ordering::Relaxed), 3);
        assert_eq!(buff.lock().len(), 0);
    }

    #[test]
    fn safe_finish_twice_is_noop() {
        let buff: Arc<HitBuffer<u32>> = Arc::new(HitBuffer::new());
        let worker = thread::spawn(|| {});
        let mut handle = Some(worker);
        safe_finish(&mut handle, buff.as_ref());
        safe_finish(&mut handle, buff.as_ref());
        assert!(handle.is_none());
    }
}
