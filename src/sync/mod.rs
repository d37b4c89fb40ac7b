//! Low-level synchronization primitives.
//!
//! Both types here are adapted from the teacher kernel's own `sync`/`kernel`
//! modules: a spinlock built directly on an `UnsafeCell` plus an
//! `AtomicBool`, and a write-once cell. The kernel versions assumed a single
//! core's worth of genuine contention and (for `SetOnce`) a single committing
//! thread; both are generalized here to be sound under arbitrary concurrent
//! access, since the address-space directory and block directories are
//! shared across every guest thread.

mod once;
mod spinlock;

pub use once::SetOnce;
pub use spinlock::SpinLock;
