use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock mutex, ported from the teacher kernel's `sync::SpinLock`.
///
/// Used here only for the dump mutex's non-ARM fallback path is not needed —
/// that lock genuinely blocks for the duration of code generation, so it is
/// `std::sync::Mutex` (see `crate::dispatch`). `SpinLock` is kept for short,
/// bounded critical sections where spinning is cheaper than a syscall; none
/// of the cache's own data structures currently need one (the directory slot
/// CAS and son exchange are lock-free), but it is part of the ambient sync
/// toolkit the rest of a real translator built on this crate would reach for
/// (e.g. around the executable-memory allocator's free list).
pub struct SpinLock<T> {
    is_locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `lock()` guard,
// which is only handed out while `is_locked` is held.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a spinlock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            is_locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// Uses the ARM `wfe`/`sev` wait/wake pair on `aarch64` hosts (this
    /// crate's emulated target), falling back to `core::hint::spin_loop` on
    /// every other host architecture the crate is built for during
    /// development/testing.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.is_locked.swap(true, Ordering::Acquire) {
            while self.is_locked.load(Ordering::Relaxed) {
                Self::wait_for_event();
            }
        }
        SpinLockGuard(self)
    }

    #[cfg(target_arch = "aarch64")]
    fn wait_for_event() {
        aarch64_cpu::asm::wfe();
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn wait_for_event() {
        core::hint::spin_loop();
    }

    /// # Safety
    ///
    /// Must only be called by the `Drop` impl of the `SpinLockGuard` that
    /// locked this mutex.
    unsafe fn unlock(&self) {
        self.is_locked.store(false, Ordering::Release);
        Self::signal_event();
    }

    #[cfg(target_arch = "aarch64")]
    fn signal_event() {
        aarch64_cpu::asm::sev();
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn signal_event() {}
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T>(&'a SpinLock<T>);

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: holding the guard means `is_locked` is set by us.
        unsafe { &*self.0.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: holding the guard means `is_locked` is set by us.
        unsafe { &mut *self.0.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard is the one that locked `self.0`.
        unsafe {
            self.0.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_under_contention() {
        let counter = Arc::new(SpinLock::new(0_u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 8000);
    }
}
