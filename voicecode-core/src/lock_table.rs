//! Per-session try-lock table (§4.3). Acquisition never blocks; denial is
//! immediate and the caller does not queue the request.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

/// Guard returned by [`SessionLockTable::acquire`]. Releases the session on
/// drop so every control-flow exit — including an early `?` return or a
/// panic unwind — releases the lock exactly once (§8 invariant 1).
#[must_use = "dropping this immediately releases the lock"]
pub struct LockGuard {
    table: SessionLockTable,
    session_id: String,
    released: bool,
}

impl LockGuard {
    /// Release ahead of drop. Calling this and then letting the guard drop
    /// is safe: the second release is a no-op (`release` is idempotent).
    pub fn release(mut self) {
        self.released = true;
        self.table.release(&self.session_id);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.table.release(&self.session_id);
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionLockTable {
    held: Arc<Mutex<HashSet<String>>>,
}

impl SessionLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire `session_id`. Returns `None` if already held.
    pub fn acquire(&self, session_id: &str) -> Option<LockGuard> {
        if self.try_acquire(session_id) {
            Some(LockGuard {
                table: self.clone(),
                session_id: session_id.to_string(),
                released: false,
            })
        } else {
            None
        }
    }

    /// Raw try-lock without a guard, for callers that need the bare bool
    /// (§4.3 contract). Prefer [`acquire`] for scoped use.
    pub fn try_acquire(&self, session_id: &str) -> bool {
        #[allow(clippy::expect_used)]
        let mut held = self.held.lock().expect("lock table mutex poisoned");
        held.insert(session_id.to_string())
    }

    pub fn release(&self, session_id: &str) {
        #[allow(clippy::expect_used)]
        let mut held = self.held.lock().expect("lock table mutex poisoned");
        held.remove(session_id);
    }

    pub fn is_locked(&self, session_id: &str) -> bool {
        #[allow(clippy::expect_used)]
        let held = self.held.lock().expect("lock table mutex poisoned");
        held.contains(session_id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn second_try_acquire_fails_while_first_holds() {
        let table = SessionLockTable::new();
        assert!(table.try_acquire("s1"));
        assert!(!table.try_acquire("s1"));
        table.release("s1");
        assert!(table.try_acquire("s1"));
    }

    #[test]
    fn release_is_idempotent() {
        let table = SessionLockTable::new();
        table.release("never-held");
        assert!(table.try_acquire("never-held"));
        table.release("never-held");
        table.release("never-held");
        assert!(!table.is_locked("never-held"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let table = SessionLockTable::new();
        {
            let _guard = table.acquire("s1").unwrap();
            assert!(table.is_locked("s1"));
        }
        assert!(!table.is_locked("s1"));
    }

    #[test]
    fn guard_releases_on_early_return_via_question_mark() {
        fn fallible(table: &SessionLockTable) -> Result<(), ()> {
            let _guard = table.acquire("s1").ok_or(())?;
            Err(())
        }

        let table = SessionLockTable::new();
        assert!(fallible(&table).is_err());
        assert!(!table.is_locked("s1"));
    }

    #[test]
    fn acquire_returns_none_when_already_held() {
        let table = SessionLockTable::new();
        let _first = table.acquire("s1").unwrap();
        assert!(table.acquire("s1").is_none());
    }

    #[test]
    fn explicit_release_method_then_drop_does_not_double_release_others() {
        let table = SessionLockTable::new();
        let guard = table.acquire("s1").unwrap();
        guard.release();
        assert!(!table.is_locked("s1"));
        assert!(table.try_acquire("s1"));
    }
}
