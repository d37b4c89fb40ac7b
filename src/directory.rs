//! The per-text-region block directory (`C2` in `spec.md` §2) and the
//! install/free lifecycle manager (`C4`).

use crate::addr::{GuestAddr, NativeAddr};
use crate::addrspace::Dynamap;
use crate::block::Dynablock;
use crate::error::DynablockError;
use crate::external::{AddressSpaceFallback, ExecutableAllocator};
use crate::sync::SetOnce;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A stable, non-owning reference to a [`DynablockList`].
///
/// `Dynablock::parent` stores one of these rather than a bare reference
/// because the directory and the block do not share a Rust lifetime in any
/// useful sense: the directory is kept alive by the address-space directory
/// (`Dynamap`) for the life of the process, and every block that can still
/// be reached (via `direct[]` or a living father's `sons`) is guaranteed by
/// construction to have a live parent, exactly per `spec.md` §3.2 invariant
/// 2 — but that guarantee lives in the protocol, not in the type system.
#[derive(Clone, Copy)]
pub struct DynablockListHandle(NonNull<DynablockList>);

// SAFETY: the pointee is only ever mutated through `&DynablockList`'s own
// interior atomics/`SetOnce`, so sharing the handle across threads is sound.
unsafe impl Send for DynablockListHandle {}
unsafe impl Sync for DynablockListHandle {}

impl DynablockListHandle {
    pub(crate) fn new(ptr: NonNull<DynablockList>) -> Self {
        Self(ptr)
    }

    /// Borrows the directory.
    #[must_use]
    pub fn get(&self) -> &DynablockList {
        // SAFETY: directories outlive every block that can reach a handle to
        // them (see the struct doc comment); the directory is never moved
        // once boxed.
        unsafe { self.0.as_ref() }
    }
}

/// One text region's block cache: a dense array from guest byte offset to
/// owning block.
pub struct DynablockList {
    /// The containing mapping's base address (informational; not used for
    /// indexing).
    base: GuestAddr,
    text: GuestAddr,
    text_size: u32,
    nolinker: bool,
    direct: SetOnce<Box<[AtomicPtr<Dynablock>]>>,
}

impl DynablockList {
    /// Creates a new, empty directory covering `[text, text + text_size)`.
    ///
    /// `eager_direct` mirrors the original's `direct` constructor parameter:
    /// when `false`, the `direct[]` array itself is allocated lazily on
    /// first `add` with `create = true`, matching `spec.md` §3.3's "creation
    /// may defer allocation for regions that never execute".
    ///
    /// # Errors
    ///
    /// Returns [`DynablockError::ZeroSizedRegion`] if `text_size == 0`.
    pub fn new(
        base: GuestAddr,
        text: GuestAddr,
        text_size: u32,
        nolinker: bool,
        eager_direct: bool,
    ) -> Result<Box<Self>, DynablockError> {
        if text_size == 0 {
            log::warn!("refusing to create a zero-sized dynablock list at {text}");
            return Err(DynablockError::ZeroSizedRegion);
        }
        let list = Box::new(Self {
            base,
            text,
            text_size,
            nolinker,
            direct: SetOnce::new(),
        });
        if eager_direct {
            let slots = Self::fresh_slots(text_size);
            list.direct
                .try_set(slots)
                .unwrap_or_else(|_| unreachable!("nothing else can observe `list` yet"));
        }
        Ok(list)
    }

    fn fresh_slots(text_size: u32) -> Box<[AtomicPtr<Dynablock>]> {
        (0..text_size as usize)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }

    /// The containing mapping's base address.
    #[must_use]
    pub fn base(&self) -> GuestAddr {
        self.base
    }

    /// Whether this directory's blocks participate in SMC detection.
    #[must_use]
    pub fn nolinker(&self) -> bool {
        self.nolinker
    }

    /// First guest byte this directory indexes.
    #[must_use]
    pub fn start(&self) -> GuestAddr {
        self.text
    }

    /// Last guest byte (inclusive) this directory indexes.
    #[must_use]
    pub fn end(&self) -> GuestAddr {
        GuestAddr(self.text.0 + self.text_size - 1)
    }

    fn in_range(&self, addr: GuestAddr) -> bool {
        addr.0 >= self.text.0 && addr.0 < self.text.0 + self.text_size
    }

    /// Whether `addr` falls within this directory's indexed range.
    #[must_use]
    pub fn contains(&self, addr: GuestAddr) -> bool {
        self.in_range(addr)
    }

    /// Plain `direct[]` read, with no creation and no delegation to another
    /// directory for an out-of-range address. Returns `None` if `addr` is
    /// out of range, `direct[]` hasn't been allocated yet, or the slot is
    /// empty.
    #[must_use]
    pub fn peek(&self, addr: GuestAddr) -> Option<NonNull<Dynablock>> {
        if !self.in_range(addr) {
            return None;
        }
        let direct = self.direct.get()?;
        NonNull::new(direct[addr.offset_from(self.text)].load(Ordering::Acquire))
    }

    /// Clamps `[addr, addr + size)` to this directory's range and returns it
    /// as `direct[]` indices. Returns an empty range if there is no overlap.
    fn clamped_indices(&self, addr: GuestAddr, size: u32) -> std::ops::Range<usize> {
        let region_start = self.text.0;
        let region_end = region_start + self.text_size;
        let start = addr.0.max(region_start);
        let end = addr.0.saturating_add(size).min(region_end);
        if start >= end {
            return 0..0;
        }
        (start - region_start) as usize..(end - region_start) as usize
    }

    /// Finds the block (or, if it is a son, its father) whose *native code
    /// range* contains `addr`. Linear scan, used only for reverse lookup
    /// (stack walking / diagnostics), never on the dispatch hot path.
    #[must_use]
    pub fn find(&self, addr: NativeAddr) -> Option<NonNull<Dynablock>> {
        let direct = self.direct.get()?;
        for slot in direct.iter() {
            let ptr = slot.load(Ordering::Acquire);
            let block = NonNull::new(ptr)?;
            // SAFETY: a non-null slot always points at a live `Dynablock`;
            // entries are only ever nulled-then-freed together (see
            // `free_dynablock`), never freed while still referenced here.
            let block_ref = unsafe { block.as_ref() };
            if block_ref.contains_native(addr) {
                return Some(block_ref.father().unwrap_or(block));
            }
        }
        None
    }

    /// Looks up or creates the block covering `addr` (`spec.md` §4.3).
    ///
    /// If `addr` falls outside this directory's range, transparently
    /// delegates to whichever directory `dynamap`/`fallback` says actually
    /// covers it — this is what lets a translation that straddles two text
    /// regions install correctly no matter which directory's `add` the
    /// caller happened to reach first.
    pub fn add(
        &self,
        addr: GuestAddr,
        create: bool,
        dynamap: &Dynamap,
        fallback: &dyn AddressSpaceFallback,
    ) -> (Option<NonNull<Dynablock>>, bool) {
        if !self.in_range(addr) {
            if let Some(dir) = dynamap.directory_for(addr) {
                return dir.add(addr, create, dynamap, fallback);
            }
            if let Some(dir) = fallback.lookup(addr) {
                return dir.add(addr, create, dynamap, fallback);
            }
            return (None, false);
        }

        let idx = addr.offset_from(self.text);

        if let Some(direct) = self.direct.get() {
            if let Some(block) = NonNull::new(direct[idx].load(Ordering::Acquire)) {
                return (Some(block), false);
            }
        }

        if !create {
            return (None, false);
        }

        let direct = match self.direct.get() {
            Some(direct) => direct,
            None => {
                let slots = Self::fresh_slots(self.text_size);
                if self.direct.try_set(slots).is_err() {
                    log::debug!("lost the race to allocate direct[] for {}", self.text);
                }
                self.direct
                    .get()
                    .expect("either we or a racing winner just set `direct`")
            }
        };

        let handle = DynablockListHandle::new(NonNull::from(self));
        let fresh = Box::into_raw(Box::new(Dynablock::new(addr, handle, None, self.nolinker)));
        match direct[idx].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => (NonNull::new(fresh), true),
            Err(winner) => {
                // SAFETY: `fresh` was just allocated above via `Box::into_raw`
                // and lost the install race; no one else observed it.
                unsafe {
                    drop(Box::from_raw(fresh));
                }
                (NonNull::new(winner), false)
            }
        }
    }

    /// Publishes a son block produced alongside its father into this
    /// directory's `direct[]`, at the son's own guest address.
    ///
    /// Mirrors the original's unconditional `direct[...] = son` assignment
    /// for sons: if a concurrent top-level `add` already raced a different
    /// block into that slot, this simply overwrites it. That race is
    /// tolerated rather than resolved (an orphaned loser is reclaimed the
    /// next time a range eviction or directory teardown walks past its own
    /// slot); see `DESIGN.md`.
    pub(crate) fn install_son(&self, addr: GuestAddr, son: NonNull<Dynablock>) {
        if !self.in_range(addr) {
            return;
        }
        let Some(direct) = self.direct.get() else {
            return;
        };
        direct[addr.offset_from(self.text)].store(son.as_ptr(), Ordering::Release);
    }

    /// Clears `addr`'s slot unconditionally, if it falls within range.
    ///
    /// Per `spec.md` §4.4 step 3: an unconditional store, not a
    /// compare-and-swap — `free` itself is the authority for whatever
    /// currently occupies the slot.
    pub(crate) fn clear_slot(&self, addr: GuestAddr) {
        if !self.in_range(addr) {
            return;
        }
        if let Some(direct) = self.direct.get() {
            direct[addr.offset_from(self.text)].store(std::ptr::null_mut(), Ordering::Release);
        }
    }

    /// Fault-handler entry point: marks every block overlapping
    /// `[addr, addr + size)` (or, for a son, its father) as needing a hash
    /// re-check. A no-op for `nolinker == false` directories (`spec.md` §4.5,
    /// P8).
    pub fn mark_range(&self, addr: GuestAddr, size: u32) {
        if !self.nolinker {
            return;
        }
        let Some(direct) = self.direct.get() else {
            return;
        };
        for idx in self.clamped_indices(addr, size) {
            let ptr = direct[idx].load(Ordering::Acquire);
            if let Some(block) = NonNull::new(ptr) {
                // SAFETY: see `find`.
                let block_ref = unsafe { block.as_ref() };
                let root = block_ref.validation_root();
                // SAFETY: `validation_root` always returns a live block: the
                // block itself, or its (non-owning but live, by invariant 2)
                // father.
                let root_ref = unsafe { root.as_ref() };
                if root_ref.nolinker() {
                    root_ref.request_test();
                }
            }
        }
    }

    /// Unload/range-eviction entry point: evicts (frees) every distinct
    /// father block overlapping `[addr, addr + size)`. A no-op for
    /// `nolinker == false` directories (P8), since such directories never
    /// produce SMC-tracked blocks in the first place and nothing should ever
    /// call this on one, but we guard it anyway for safety against a
    /// misbehaving caller.
    pub fn free_range(&self, addr: GuestAddr, size: u32, allocator: &dyn ExecutableAllocator) {
        if !self.nolinker {
            return;
        }
        let Some(direct) = self.direct.get() else {
            return;
        };
        let mut roots = Vec::new();
        let mut seen = HashSet::new();
        for idx in self.clamped_indices(addr, size) {
            let ptr = direct[idx].swap(std::ptr::null_mut(), Ordering::AcqRel);
            if let Some(block) = NonNull::new(ptr) {
                // SAFETY: see `find`.
                let root = unsafe { block.as_ref() }.father().unwrap_or(block);
                if seen.insert(root.as_ptr() as usize) {
                    roots.push(root);
                }
            }
        }
        for root in roots {
            free_dynablock(root, allocator);
        }
    }

    /// Tears down the whole directory, freeing every non-son block it owns
    /// (sons are freed transitively, by their father).
    pub fn free_all(&self, allocator: &dyn ExecutableAllocator) {
        let Some(direct) = self.direct.get() else {
            return;
        };
        for slot in direct.iter() {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if let Some(block) = NonNull::new(ptr) {
                // SAFETY: see `find`.
                if unsafe { block.as_ref() }.father().is_none() {
                    free_dynablock(block, allocator);
                }
            }
        }
    }
}

/// Frees `block`, cascading to all of its living sons, and — only if
/// `block` is itself a father (`father == None`) — releasing its native
/// code region via `allocator`. Idempotent: a second call on an
/// already-gone block (directly, or reached again via cascade) is a no-op
/// (`spec.md` §4.4 step 1, P7).
///
/// This crate does not implement the quiescence/epoch scheme `spec.md` §9
/// flags as an open question: a thread may still be executing `block`'s
/// native code when this runs. That hazard is inherited from the original
/// unchanged; see `DESIGN.md`.
pub fn free_dynablock(block: NonNull<Dynablock>, allocator: &dyn ExecutableAllocator) {
    // SAFETY: every caller of `free_dynablock` obtained `block` either from
    // a `direct[]` slot it just swapped to null, or from a father's `sons`
    // entry it just exchanged to null — in both cases this call is the sole
    // owner of that particular reference, and `mark_gone` below still
    // protects against the same block being reached a second time via a
    // different path (e.g. both a direct `direct[]` entry and a range
    // eviction racing on the same father).
    let block_ref = unsafe { block.as_ref() };
    if !block_ref.mark_gone() {
        return;
    }

    block_ref.parent().get().clear_slot(block_ref.guest_addr());

    for son_slot in block_ref.sons() {
        let son_ptr = son_slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if let Some(son) = NonNull::new(son_ptr) {
            free_dynablock(son, allocator);
        }
    }

    if block_ref.father().is_none() {
        if let Some(native_code) = block_ref.native_code() {
            // SAFETY: `father().is_none()` means, by invariant 4, that this
            // block exclusively owns `native_code`/`native_size`; `mark_gone`
            // above guarantees this runs at most once for this block.
            unsafe {
                allocator.free(native_code, block_ref.native_size());
            }
        }
    }

    // SAFETY: `block` was heap-allocated via `Box::into_raw` by `add` or by
    // whichever `CodeGenerator` constructed it as a son, and `mark_gone`
    // guarantees we are the only caller that reaches this point for it.
    unsafe {
        drop(Box::from_raw(block.as_ptr()));
    }
}
