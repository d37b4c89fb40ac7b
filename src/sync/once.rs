use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// A cell that may be set at most once, ported from the teacher kernel's
/// `kernel::once::SetOnce`.
///
/// The original assumed a single thread ever calls `set` and simply asserted
/// on a second attempt. The address-space directory's top-level shards can
/// legitimately race two loader threads mapping overlapping regions at
/// startup (`spec.md` §4.1 only promises slots aren't *reused*, not that a
/// single writer installs each one), so this version additionally exposes
/// [`SetOnce::try_set`] for the loser to fail gracefully instead of
/// panicking.
#[derive(Debug, Default)]
pub struct SetOnce<T> {
    inner: OnceLock<T>,
    is_set: AtomicBool,
}

impl<T> SetOnce<T> {
    /// Creates an unset `SetOnce`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
            is_set: AtomicBool::new(false),
        }
    }

    /// Sets the value.
    ///
    /// # Panics
    ///
    /// Panics if the value is already set.
    pub fn set(&self, value: T) {
        assert!(self.try_set(value).is_ok(), "SetOnce already set");
    }

    /// Attempts to set the value, returning `Err(value)` if it was already
    /// set by a concurrent caller.
    pub fn try_set(&self, value: T) -> Result<(), T> {
        if self.is_set.swap(true, Ordering::AcqRel) {
            return Err(value);
        }
        self.inner
            .set(value)
            .unwrap_or_else(|_| unreachable!("is_set guards against a second OnceLock::set"));
        Ok(())
    }

    /// Gets the value, if set.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        self.inner.get()
    }
}
