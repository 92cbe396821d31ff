// src/messaging/mod.rs
// Building blocks shared by exchanges and queues

pub mod codec;
pub mod correlation;
pub mod events;
pub(crate) mod readiness;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use codec::Payload;
pub use correlation::ReplyFuture;
pub use events::{ConnectionEvent, EventBus, ExchangeEvent, QueueEvent};

/// Locks a mutex, recovering the data if a previous holder panicked.
/// Guards are never held across an `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
