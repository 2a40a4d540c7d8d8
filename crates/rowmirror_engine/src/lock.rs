//! Write-suppression flag.
//!
//! While a session applies state it did not originate (a read or an
//! accepted remote change), the lock is held so the change detector treats
//! the resulting mutations as non-events.
//!
//! This is a single boolean, not a queue. A local edit and a remote apply
//! that land in the same scheduling quantum can still race; the session
//! resolves that by last-writer-wins.

use std::sync::atomic::{AtomicBool, Ordering};

/// A single-flag mutual exclusion marker.
#[derive(Debug, Default)]
pub struct WriteLock {
    updating: AtomicBool,
}

impl WriteLock {
    /// Creates an unlocked flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a guard is alive.
    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Sets the flag, or returns `None` if it is already set.
    pub fn try_acquire(&self) -> Option<WriteGuard<'_>> {
        self.updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }
}

/// Clears the flag when dropped.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a WriteLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.updating.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let lock = WriteLock::new();
        assert!(!lock.is_updating());

        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_updating());
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_updating());
        assert!(lock.try_acquire().is_some());
    }
}
