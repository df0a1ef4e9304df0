// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recursive mutex and counting semaphore.
//!
//! Thin OS-abstraction wrappers: the mutex is re-entrant for its owning
//! thread (the legacy engine relies on nested locking through callback
//! paths), the semaphore is a plain counting semaphore with a zero / finite
//! / forever `take`.

use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;

use crate::api::{Error, Result};
use crate::vos::time::TimeVal;

// ============================================================================
// Recursive mutex
// ============================================================================

/// Recursive mutex protecting a `T`.
///
/// Re-entrance is per thread: the owner may lock again without deadlocking.
/// Data access goes through [`VosMutexGuard::with`] / `with_mut`, which
/// borrow-checks at runtime so a re-entrant holder cannot alias a live
/// mutable borrow.
pub struct VosMutex<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

/// Guard returned by [`VosMutex::lock`] / [`VosMutex::try_lock`].
pub struct VosMutexGuard<'a, T> {
    guard: ReentrantMutexGuard<'a, RefCell<T>>,
}

impl<T> VosMutex<T> {
    /// Create a mutex owning `value`.
    pub fn new(value: T) -> Self {
        VosMutex {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Lock, blocking until available (immediately for a re-entrant owner).
    pub fn lock(&self) -> VosMutexGuard<'_, T> {
        VosMutexGuard {
            guard: self.inner.lock(),
        }
    }

    /// Lock without blocking; fails with `MutexInUse` when another thread
    /// holds the mutex.
    pub fn try_lock(&self) -> Result<VosMutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Some(guard) => Ok(VosMutexGuard { guard }),
            None => Err(Error::MutexInUse),
        }
    }
}

impl<'a, T> VosMutexGuard<'a, T> {
    /// Run `f` with shared access to the protected value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.guard.borrow())
    }

    /// Run `f` with exclusive access to the protected value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.guard.borrow_mut())
    }
}

// ============================================================================
// Counting semaphore
// ============================================================================

/// Initial state of a [`VosSemaphore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaState {
    /// Counter starts at zero; the first `take` waits for a `give`.
    Empty,
    /// Counter starts at one.
    Full,
}

/// Counting semaphore. `give` never blocks; `take` polls, waits bounded, or
/// waits forever.
pub struct VosSemaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl VosSemaphore {
    /// Create a semaphore in the given initial state.
    pub fn new(initial: SemaState) -> Self {
        VosSemaphore {
            count: Mutex::new(match initial {
                SemaState::Empty => 0,
                SemaState::Full => 1,
            }),
            cond: Condvar::new(),
        }
    }

    /// Take one unit.
    ///
    /// - `Some(ZERO)`: poll, fail with `Sema` if the counter is zero.
    /// - `Some(tv)`: wait up to `tv`, then fail with `Sema`.
    /// - `None`: wait forever.
    pub fn take(&self, timeout: Option<TimeVal>) -> Result<()> {
        let mut count = self.count.lock();
        match timeout {
            Some(tv) if tv.is_zero() => {
                if *count == 0 {
                    return Err(Error::Sema);
                }
            }
            Some(tv) => {
                let deadline = std::time::Instant::now() + tv.as_duration();
                while *count == 0 {
                    if self.cond.wait_until(&mut count, deadline).timed_out() {
                        return Err(Error::Sema);
                    }
                }
            }
            None => {
                while *count == 0 {
                    self.cond.wait(&mut count);
                }
            }
        }
        *count -= 1;
        Ok(())
    }

    /// Give one unit back; wakes one waiter. Never blocks.
    pub fn give(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mutex_reentrant_lock() {
        let m = VosMutex::new(0u32);
        let g1 = m.lock();
        let g2 = m.lock(); // same thread: no deadlock
        g1.with_mut(|v| *v += 1);
        g2.with_mut(|v| *v += 1);
        drop((g1, g2));
        assert_eq!(m.lock().with(|v| *v), 2);
    }

    #[test]
    fn mutex_try_lock_reports_in_use() {
        let m = Arc::new(VosMutex::new(()));
        let g = m.lock();
        let m2 = Arc::clone(&m);
        let r = std::thread::spawn(move || m2.try_lock().is_err())
            .join()
            .expect("join");
        assert!(r);
        drop(g);
    }

    #[test]
    fn semaphore_full_poll_succeeds_once() {
        let s = VosSemaphore::new(SemaState::Full);
        assert!(s.take(Some(TimeVal::ZERO)).is_ok());
        assert!(matches!(s.take(Some(TimeVal::ZERO)), Err(Error::Sema)));
    }

    #[test]
    fn semaphore_timed_take_expires() {
        let s = VosSemaphore::new(SemaState::Empty);
        let start = std::time::Instant::now();
        assert!(matches!(
            s.take(Some(TimeVal::from_millis(20))),
            Err(Error::Sema)
        ));
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
    }

    #[test]
    fn semaphore_give_wakes_waiter() {
        let s = Arc::new(VosSemaphore::new(SemaState::Empty));
        let s2 = Arc::clone(&s);
        let t = std::thread::spawn(move || s2.take(Some(TimeVal::new(2, 0))));
        std::thread::sleep(std::time::Duration::from_millis(10));
        s.give();
        assert!(t.join().expect("join").is_ok());
    }

    #[test]
    fn semaphore_counts() {
        let s = VosSemaphore::new(SemaState::Empty);
        s.give();
        s.give();
        assert!(s.take(Some(TimeVal::ZERO)).is_ok());
        assert!(s.take(Some(TimeVal::ZERO)).is_ok());
        assert!(s.take(Some(TimeVal::ZERO)).is_err());
    }
}
