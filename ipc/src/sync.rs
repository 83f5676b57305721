use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires a kernel lock
///
/// A panic while holding a kernel lock aborts the kernel, so a poisoned
/// mutex only shows up in tests that deliberately panic a worker thread.
/// The protected state is still structurally valid there.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
