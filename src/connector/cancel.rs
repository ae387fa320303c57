//! Cooperative cancellation for retrying calls.
//!
//! A [`CancelToken`] entered on a thread is observed by every retry loop running on that
//! thread: a cancelled call stops retrying, and a retry sleep wakes as soon as the token is
//! cancelled. An in-flight socket exchange is never interrupted.
use std::{
    cell::RefCell,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::ClientError;

thread_local! {
    static CURRENT: RefCell<Vec<CancelToken>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs this token for the current thread until the guard is dropped.
    pub fn enter(&self) -> CancelGuard {
        CURRENT.with(|current| current.borrow_mut().push(self.clone()));
        CancelGuard { _private: () }
    }

    /// Token installed on the current thread, if any.
    pub fn current() -> Option<CancelToken> {
        CURRENT.with(|current| current.borrow().last().cloned())
    }

    /// Sleeps for `duration`, failing with [`ClientError::Cancelled`] if cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + duration;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(ClientError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            cancelled = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Removes the entered token from the current thread on drop.
#[must_use]
pub struct CancelGuard {
    _private: (),
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            current.borrow_mut().pop();
        });
    }
}

/// Whether the current thread's token has been cancelled.
pub(crate) fn cancelled() -> bool {
    CancelToken::current().is_some_and(|token| token.is_cancelled())
}

/// Retry sleep honouring the current thread's token.
pub(crate) fn sleep(duration: Duration) -> Result<(), ClientError> {
    match CancelToken::current() {
        Some(token) => token.sleep(duration),
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn entered_token_is_visible_until_dropped() {
        let token = CancelToken::new();
        assert!(CancelToken::current().is_none());
        {
            let _guard = token.enter();
            assert!(CancelToken::current().is_some());
            assert!(!cancelled());
            token.cancel();
            assert!(cancelled());
        }
        assert!(CancelToken::current().is_none());
    }

    #[test]
    fn cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let res = remote.sleep(Duration::from_secs(30));
            (res, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        let (res, elapsed) = handle.join().unwrap();
        assert!(matches!(res, Err(ClientError::Cancelled)));
        assert!(elapsed < Duration::from_secs(5));
    }
}
