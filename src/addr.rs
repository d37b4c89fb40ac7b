//! Guest and host address newtypes.
//!
//! The original C source passes both x86 guest addresses and ARM native
//! (host) addresses around as bare `uintptr_t`. Keeping them as distinct
//! types here means a directory's `text` range and a block's `native_code`
//! pointer can never be silently compared or added together.

use derive_more::{Add, From, Into, Sub};

/// A byte address in the emulated x86 guest's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, Sub, From, Into)]
pub struct GuestAddr(pub u32);

impl GuestAddr {
    /// Offset of this address from `base`, as used to index a `direct[]` array.
    ///
    /// # Panics
    ///
    /// Panics if `self` is before `base`.
    #[must_use]
    pub fn offset_from(self, base: GuestAddr) -> usize {
        usize::try_from(self.0 - base.0).expect("offset should fit in a usize")
    }
}

impl core::fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A byte address in the host's (ARM) executable-code heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, Sub, From, Into)]
pub struct NativeAddr(pub usize);

impl NativeAddr {
    /// Returns `true` if `addr` falls within `[self, self + len)`.
    #[must_use]
    pub fn contains(self, len: usize, addr: NativeAddr) -> bool {
        addr.0 >= self.0 && addr.0 < self.0 + len
    }
}

impl core::fmt::Display for NativeAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
