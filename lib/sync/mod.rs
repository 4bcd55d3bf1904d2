//! Synchronization primitives.
//!
//! Shims between loom and std synchronization primitives. The reaper's gate monitor and its
//! records go through these so that the scheduler handshake can be model-checked under
//! `--cfg loom`.
pub mod atomic;
pub mod path_lock;

#[cfg(loom)]
pub use loom::sync::{Condvar, Mutex, MutexGuard};

#[cfg(not(loom))]
pub use std::sync::{Condvar, Mutex, MutexGuard};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// The reaper never leaves a record or queue half-updated across a panic point, so the data
/// behind a poisoned lock is still consistent.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
