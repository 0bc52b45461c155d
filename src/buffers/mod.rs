//! Shared channels between the acquisition callbacks, the processor and
//! the storage workers. Each channel owns its mutex/condvar pair plus a
//! stop flag, so the shutdown helper can wake and join a waiting worker.

pub mod hit_buffer;
pub mod shutdown;
pub mod species_queue;

pub use hit_buffer::HitBuffer;
pub use shutdown::{StopGuard, safe_finish};
pub use species_queue::SpeciesQueue;
