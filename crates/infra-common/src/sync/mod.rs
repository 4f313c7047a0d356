use std::sync::Arc;

use parking_lot::ReentrantMutex;

/// Per-call-leg serialization lock.
///
/// Re-entrant so that a timer callback or a transaction handler already
/// holding the lock can call back into the same call leg.
pub type SessionLock = Arc<ReentrantMutex<()>>;

/// Create a fresh, unshared session lock
pub fn new_session_lock() -> SessionLock {
    Arc::new(ReentrantMutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lock_is_reentrant() {
        let lock = new_session_lock();
        let _outer = lock.lock();
        let inner = lock.try_lock();
        assert!(inner.is_some());
    }
}
