//! Collaborators the cache consumes but does not implement.
//!
//! `spec.md` §1 and §6 name four things as out of scope and specified only
//! by the interface the core calls: the opcode-level code generator
//! (`FillBlock`), raw guest-memory access plus write-protection
//! (`protectDB`), the executable-memory allocator (`FreeDynarecMap`), and
//! the ELF-loader fallback (`GetDynablocksFromAddress`). Each becomes a
//! trait here so the cache can be built and tested without a real ARM
//! backend; each trait also ships exactly one concrete implementation meant
//! for tests, backed by real `mmap`/`mprotect` rather than an in-memory
//! fake, since a translation cache that is never driven against real pages
//! isn't exercising the part of the design (§4.5) that matters.

use crate::addr::{GuestAddr, NativeAddr};
use crate::directory::DynablockList;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

/// One translated child block, as produced by a [`CodeGenerator`] alongside
/// its father.
#[derive(Debug)]
pub struct SonFill {
    /// The guest address this son is the entry point for.
    pub guest_addr: GuestAddr,
    /// Byte offset of this son's code within the father's `native_code` region.
    pub native_offset: usize,
}

/// Everything a [`CodeGenerator`] produces for one `FillBlock` call.
///
/// Stands in for the original's practice of writing the fields of
/// `dynablock_t` directly; bundling them into one value instead keeps
/// `Dynablock`'s fields private to `crate::block` and makes partial/aliased
/// mutation during fill impossible by construction.
#[derive(Debug)]
pub struct FillResult {
    /// Number of guest bytes this translation consumed.
    pub guest_size: u32,
    /// Where the generated native code was written.
    pub native_code: NativeAddr,
    /// Length of the generated native code, in bytes.
    pub native_size: usize,
    /// `X31_hash_code` of the guest bytes at fill time (0 if the owning
    /// directory's `nolinker` is false; see `Dynablock::nolinker`).
    pub hash: u32,
    /// Opaque per-instruction size table, owned by the block.
    pub instsize: Box<[u8]>,
    /// Opaque per-instruction metadata table, owned by the block.
    pub table: Box<[u32]>,
    /// Sons spawned while translating (e.g. fall-through continuations).
    pub sons: Vec<SonFill>,
}

/// Stands in for `FillBlock(block, fill_addr)`.
pub trait CodeGenerator {
    /// Translates guest code starting at `fill_addr`, for a block whose
    /// canonical entry point is `target` (equal to `fill_addr` except for
    /// [`crate::dispatch::Dispatcher::get_alternate_block`] splice targets).
    fn fill_block(
        &self,
        target: GuestAddr,
        fill_addr: GuestAddr,
        guest_memory: &dyn GuestMemory,
        allocator: &dyn ExecutableAllocator,
    ) -> FillResult;
}

/// Stands in for raw guest-memory access plus `protectDB`.
pub trait GuestMemory {
    /// Reads `len` guest bytes starting at `addr`.
    fn read(&self, addr: GuestAddr, len: u32) -> Vec<u8>;
    /// Write-protects `[addr, addr + len)` so that a guest write triggers a
    /// fault the embedder is expected to turn into a [`crate::directory::DynablockList::mark_range`] call.
    fn protect(&self, addr: GuestAddr, len: u32);
}

/// Stands in for `FreeDynarecMap`'s backing allocator.
pub trait ExecutableAllocator {
    /// Allocates `len` bytes of RWX (or RX, post-fill) memory for native code.
    fn alloc(&self, len: usize) -> NativeAddr;
    /// Releases a region previously returned by `alloc`.
    ///
    /// # Safety
    ///
    /// `addr`/`len` must describe a live allocation from this allocator that
    /// is not the `native_code` region of any son block that is still alive.
    unsafe fn free(&self, addr: NativeAddr, len: usize);
}

/// Stands in for `GetDynablocksFromAddress`, the ELF-loader fallback used
/// when the address-space directory (`crate::addrspace::Dynamap`) has no
/// shard installed for an address.
pub trait AddressSpaceFallback {
    /// Looks up the directory covering `addr` via the loader's own records,
    /// independent of the address-space directory's shard table.
    fn lookup(&self, addr: GuestAddr) -> Option<&DynablockList>;
}

/// An `AddressSpaceFallback` with nothing to fall back to, for embedders
/// (and tests) where the address-space directory is always fully populated
/// up front.
#[derive(Debug, Default)]
pub struct NoFallback;

impl AddressSpaceFallback for NoFallback {
    fn lookup(&self, _addr: GuestAddr) -> Option<&DynablockList> {
        None
    }
}

/// A `mmap`-backed guest memory region, real enough to drive SMC detection
/// end to end in tests.
pub struct MmapGuestMemory {
    base: GuestAddr,
    len: usize,
    ptr: NonNull<u8>,
}

// SAFETY: `ptr` is a stable `mmap` allocation; all access goes through
// `&self` methods that never alias a mutable reference across threads.
unsafe impl Send for MmapGuestMemory {}
unsafe impl Sync for MmapGuestMemory {}

impl MmapGuestMemory {
    /// Maps `len` bytes of guest memory starting at `base`, initially
    /// read-write (not yet protected).
    ///
    /// # Panics
    ///
    /// Panics if the underlying `mmap` call fails or `len` is zero.
    #[must_use]
    pub fn new(base: GuestAddr, len: usize) -> Self {
        let len_nz = NonZeroUsize::new(len).expect("guest memory region must be non-empty");
        // SAFETY: anonymous, fixed-length private mapping; no file descriptor
        // is involved and the mapping is unmapped in `Drop`.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .expect("mmap for guest memory should succeed")
        };
        Self {
            base,
            len,
            ptr: ptr.cast(),
        }
    }

    fn offset(&self, addr: GuestAddr, len: u32) -> usize {
        let start = addr.offset_from(self.base);
        assert!(
            start + len as usize <= self.len,
            "guest access out of mapped range"
        );
        start
    }

    /// Writes `bytes` at `addr`, temporarily lifting write-protection if
    /// necessary. Used by tests to simulate a guest (or another process)
    /// performing self-modifying writes; a real embedder would instead take
    /// the write fault, perform the write, and call
    /// [`crate::directory::DynablockList::mark_range`] from the handler.
    ///
    /// # Panics
    ///
    /// Panics if the write falls outside the mapped region.
    pub fn simulate_guest_write(&self, addr: GuestAddr, bytes: &[u8]) {
        let start = self.offset(addr, bytes.len() as u32);
        // SAFETY: `start..start+bytes.len()` was checked against `self.len`
        // above, and we own the full mapping.
        unsafe {
            mprotect(
                self.ptr.cast(),
                self.len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            )
            .expect("mprotect to unlock for simulated write should succeed");
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(start), bytes.len());
        }
    }
}

impl GuestMemory for MmapGuestMemory {
    fn read(&self, addr: GuestAddr, len: u32) -> Vec<u8> {
        let start = self.offset(addr, len);
        // SAFETY: `start..start+len` was checked against `self.len` above.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), len as usize).to_vec() }
    }

    fn protect(&self, addr: GuestAddr, len: u32) {
        let _ = self.offset(addr, len);
        // SAFETY: the whole mapping is owned by `self`; narrowing to just
        // `[addr, addr+len)` would require page alignment bookkeeping this
        // stand-in doesn't need for tests, so the whole region is protected.
        unsafe {
            mprotect(self.ptr.cast(), self.len, ProtFlags::PROT_READ)
                .expect("mprotect to lock guest memory should succeed");
        }
    }
}

impl Drop for MmapGuestMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe the mapping created in `new`, which
        // is unmapped exactly once here.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

/// A `mmap`-backed executable-memory allocator.
///
/// Unlike a production allocator (box86's own sub-allocates from a handful
/// of large reserved regions) this maps and unmaps one region per block;
/// fine for tests, wrong for a hot path that installs thousands of blocks a
/// second, which is exactly the kind of allocation-strategy detail
/// `SPEC_FULL.md` §1 calls out of scope.
#[derive(Debug, Default)]
pub struct MmapExecutableAllocator;

impl ExecutableAllocator for MmapExecutableAllocator {
    fn alloc(&self, len: usize) -> NativeAddr {
        let len_nz = NonZeroUsize::new(len).expect("native code region must be non-empty");
        // SAFETY: anonymous mapping, immediately made RWX; the embedder is
        // responsible (as box86 itself is) for flushing the instruction
        // cache after writing code before it is ever executed.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE,
            )
            .expect("mmap for native code should succeed")
        };
        NativeAddr(ptr.as_ptr() as usize)
    }

    unsafe fn free(&self, addr: NativeAddr, len: usize) {
        let Some(ptr) = NonNull::new(addr.0 as *mut std::ffi::c_void) else {
            return;
        };
        // SAFETY: the caller guarantees `addr`/`len` is a live allocation
        // from `alloc` that no living block still references.
        unsafe {
            let _ = munmap(ptr, len);
        }
    }
}

/// A [`CodeGenerator`] that "translates" by copying guest bytes verbatim,
/// enough to exercise install/hash/invalidate without a real ARM backend.
/// Only used by this crate's own tests.
#[derive(Debug, Default)]
pub struct IdentityCodeGenerator {
    /// Number of guest bytes each call consumes.
    pub block_len: u32,
}

impl CodeGenerator for IdentityCodeGenerator {
    fn fill_block(
        &self,
        _target: GuestAddr,
        fill_addr: GuestAddr,
        guest_memory: &dyn GuestMemory,
        allocator: &dyn ExecutableAllocator,
    ) -> FillResult {
        let bytes = guest_memory.read(fill_addr, self.block_len);
        let hash = crate::hash::x31_hash(&bytes);
        let native_code = allocator.alloc(bytes.len().max(1));
        // SAFETY: `native_code` was just allocated above with `bytes.len()`
        // (or 1) writable bytes; the copy stays within that allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                native_code.0 as *mut u8,
                bytes.len(),
            );
        }
        FillResult {
            guest_size: self.block_len,
            native_code,
            native_size: bytes.len().max(1),
            hash,
            instsize: vec![1; bytes.len()].into_boxed_slice(),
            table: Vec::new().into_boxed_slice(),
            sons: Vec::new(),
        }
    }
}
