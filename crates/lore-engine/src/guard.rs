//! Reentrancy protection for a context.
//!
//! A thread executing a callback body carries a marker for the context that
//! invoked it. Public entry points check the marker and fail with
//! `KbError::Locked` instead of deadlocking. Callback bodies and network
//! merges on one context are serialized by an exclusive lock.

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::KbError;

thread_local! {
    static ACTIVE_CALLBACKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn is_marked(context_id: u64) -> bool {
    ACTIVE_CALLBACKS.with(|active| active.borrow().contains(&context_id))
}

/// Removes the marker when the callback returns or unwinds.
struct Marker {
    context_id: u64,
}

impl Marker {
    fn enter(context_id: u64) -> Self {
        ACTIVE_CALLBACKS.with(|active| active.borrow_mut().push(context_id));
        Self { context_id }
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        ACTIVE_CALLBACKS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|id| *id == self.context_id) {
                active.remove(pos);
            }
        });
    }
}

#[derive(Debug)]
pub struct Guard {
    context_id: u64,
    exclusive: Mutex<()>,
}

impl Guard {
    pub fn new(context_id: u64) -> Self {
        Self {
            context_id,
            exclusive: Mutex::new(()),
        }
    }

    /// Whether the calling thread is inside a callback for this context.
    pub fn is_locked(&self) -> bool {
        is_marked(self.context_id)
    }

    /// Fails fast when called from inside a callback for this context.
    pub fn check(&self) -> Result<(), KbError> {
        if self.is_locked() {
            return Err(KbError::Locked);
        }
        Ok(())
    }

    /// Enters the exclusive section. Blocks while another thread holds it.
    pub fn exclusive(&self) -> Result<Exclusive<'_>, KbError> {
        self.check()?;
        let lock = self
            .exclusive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(Exclusive {
            context_id: self.context_id,
            _lock: lock,
        })
    }
}

/// Held while a callback body or merge runs on a context.
pub struct Exclusive<'a> {
    context_id: u64,
    _lock: MutexGuard<'a, ()>,
}

impl Exclusive<'_> {
    /// Runs `body` with the reentrancy marker set for this thread.
    pub fn run_callback<R>(&self, body: impl FnOnce() -> R) -> R {
        let _marker = Marker::enter(self.context_id);
        body()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;

    use super::Guard;
    use crate::error::KbError;

    #[test]
    fn marker_is_scoped_to_callback_body() {
        let guard = Guard::new(7);
        assert!(guard.check().is_ok());
        {
            let section = guard.exclusive().expect("section should open");
            section.run_callback(|| {
                assert_eq!(guard.check(), Err(KbError::Locked));
                assert!(matches!(guard.exclusive(), Err(KbError::Locked)));
            });
        }
        assert!(guard.check().is_ok());
    }

    #[test]
    fn marker_is_per_context() {
        let first = Guard::new(1);
        let second = Guard::new(2);
        let section = first.exclusive().expect("section should open");
        section.run_callback(|| {
            assert!(first.is_locked());
            assert!(!second.is_locked());
        });
    }

    #[test]
    fn marker_is_per_thread() {
        let guard = Arc::new(Guard::new(3));
        let section = guard.exclusive().expect("section should open");
        section.run_callback(|| {
            let other = Arc::clone(&guard);
            let seen = thread::spawn(move || other.is_locked())
                .join()
                .expect("thread should finish");
            assert!(!seen);
        });
    }

    #[test]
    fn marker_is_cleared_after_panic() {
        let guard = Guard::new(4);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let section = guard.exclusive().expect("section should open");
            section.run_callback(|| panic!("callback failure"));
        }));
        assert!(result.is_err());
        assert!(guard.check().is_ok());
        assert!(guard.exclusive().is_ok());
    }
}
