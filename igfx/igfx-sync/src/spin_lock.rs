use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// The coarse device-wide lock.
///
/// Exactly two entry points, because that is all the resource layer
/// needs: [`lock`](Self::lock) for guard-based access and
/// [`with_lock`](Self::with_lock) for closures. Everything behind the
/// lock is mutated as plain data.
pub struct SpinLock<T> {
    held: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: at most one guard exists at a time, so only T: Send is needed
// for the lock to be shared across threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wrap `inner` in an unlocked lock.
    pub const fn new(inner: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Spin until acquired.
    ///
    /// Between acquisition attempts, waiters spin on a plain load so they
    /// do not bounce the lock's cache line with failed writes.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Run `f` with the lock held for exactly that call.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

/// Exclusive access to the locked value; releases on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section to the next holder.
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn serializes_increments() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.with_lock(|v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn guard_drop_releases_the_lock() {
        let lock = SpinLock::new(5);
        drop(lock.lock());
        // A second acquisition on the same thread must not deadlock.
        assert_eq!(*lock.lock(), 5);
    }
}
