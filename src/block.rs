//! The translated-block type (`C3` in `spec.md` §2), the dynablock itself.

use crate::addr::{GuestAddr, NativeAddr};
use crate::directory::DynablockListHandle;
use crate::external::FillResult;
use bitfield_struct::bitfield;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicBool, Ordering};

/// `done`/`nolinker` packed into one byte.
///
/// Both bits are written exactly once after construction (by the installer,
/// for `done`; at construction time, for `nolinker`) and never concurrently
/// with a read that matters for correctness, so they share a single plain
/// (non-atomic) word rather than two more `AtomicBool`s. Contrast with
/// `gone`/`need_test` on [`Dynablock`], which are genuinely raced and stay
/// as separate atomics.
#[bitfield(u8)]
pub struct DynablockFlags {
    /// Participates in SMC detection (hashing + page protection). Propagated
    /// from the owning directory at block-creation time; `false` marks a
    /// permanently pinned linker stub.
    pub nolinker: bool,
    /// Set once `FillBlock`/`CodeGenerator::fill_block` has populated the
    /// block. Mirrors the original's `db->done` field: reset to `false` on
    /// free, otherwise not consulted by the dispatch path (`spec.md` §3.1
    /// lists it as a lifecycle flag without specifying a reader; we preserve
    /// that fidelity rather than inventing a gate the original doesn't have).
    pub done: bool,
    #[bits(6)]
    __reserved: u8,
}

/// State populated by a [`crate::external::CodeGenerator`] after the block
/// has already been installed into its directory (`spec.md` §4.3 step 6).
///
/// This is the one place this crate knowingly inherits the original's
/// unresolved concurrency hazard: a reader that obtains this block via
/// `direct[]` before the installing thread finishes filling it observes
/// whatever is in `fill` at that instant (`None`, mid-write, or complete).
/// `spec.md` §9 calls out a sibling hazard (reclaiming code while it
/// executes) as an open question to be documented, not silently fixed; the
/// same instruction applies here, since the original C has no
/// synchronization around this window either. See `DESIGN.md`.
struct FillState {
    guest_size: u32,
    native_code: NativeAddr,
    native_size: usize,
    hash: u32,
    instsize: Box<[u8]>,
    table: Box<[u32]>,
    sons: Vec<AtomicPtr<Dynablock>>,
}

/// One cached translation: metadata, a pointer to generated native code, an
/// integrity hash, and parent/child links.
pub struct Dynablock {
    guest_addr: GuestAddr,
    /// Non-owning: the directory this block is (or was) installed into.
    parent: DynablockListHandle,
    /// Non-owning: `None` for a top-level block, `Some` for a son.
    father: Option<NonNull<Dynablock>>,
    /// `true` once `free` has begun; makes `free` idempotent under races.
    gone: AtomicBool,
    /// Set by `mark_range`/`MarkDynablock`; cleared after a successful
    /// re-hash. See `spec.md` §4.5.
    need_test: AtomicBool,
    flags: UnsafeCell<DynablockFlags>,
    fill: UnsafeCell<Option<FillState>>,
}

// SAFETY: every field is either behind an atomic, or only ever written
// before the block is shared and read-only afterward (`guest_addr`,
// `parent`, `father`), with the sole documented exception of `fill`/`flags`,
// whose hazard is described above and in `DESIGN.md`.
unsafe impl Send for Dynablock {}
unsafe impl Sync for Dynablock {}

impl Dynablock {
    /// Creates a fresh, unfilled block. Used only by the installer
    /// (`DynablockList::add`) immediately before attempting to publish it.
    pub(crate) fn new(
        guest_addr: GuestAddr,
        parent: DynablockListHandle,
        father: Option<NonNull<Dynablock>>,
        nolinker: bool,
    ) -> Self {
        Self {
            guest_addr,
            parent,
            father,
            gone: AtomicBool::new(false),
            need_test: AtomicBool::new(false),
            flags: UnsafeCell::new(DynablockFlags::new().with_nolinker(nolinker)),
            fill: UnsafeCell::new(None),
        }
    }

    /// The guest address this block's canonical entry point covers.
    #[must_use]
    pub fn guest_addr(&self) -> GuestAddr {
        self.guest_addr
    }

    /// The directory that owns (or owned) this block.
    #[must_use]
    pub fn parent(&self) -> DynablockListHandle {
        self.parent
    }

    /// The owning father, if this block is a son.
    #[must_use]
    pub fn father(&self) -> Option<NonNull<Dynablock>> {
        self.father
    }

    /// The block whose hash/SMC state actually governs this one: itself,
    /// for a top-level block, or its father for a son.
    #[must_use]
    pub fn validation_root(&self) -> NonNull<Dynablock> {
        self.father.unwrap_or_else(|| {
            NonNull::from(self)
        })
    }

    fn flags(&self) -> DynablockFlags {
        // SAFETY: `flags` is written once at construction and once more by
        // `mark_done`; both writers serialize through the single-installer
        // discipline documented on `FillState`.
        unsafe { *self.flags.get() }
    }

    /// Whether this block participates in SMC detection.
    #[must_use]
    pub fn nolinker(&self) -> bool {
        self.flags().nolinker()
    }

    /// Whether `FillBlock`/`CodeGenerator::fill_block` has completed for
    /// this block. Informational only; see [`DynablockFlags::done`].
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.flags().done()
    }

    /// Marks this block as filled. Called once, by the installer, right
    /// after `fill_with` populates it.
    fn mark_done(&self) {
        // SAFETY: only the installer thread calls this, exactly once, after
        // `fill_with`.
        unsafe {
            let flags = &mut *self.flags.get();
            *flags = flags.with_done(true);
        }
    }

    /// Builds a son sharing `father`'s native code region at `native_offset`,
    /// already filled and marked done. Used only by `fill_with` to turn the
    /// [`crate::external::SonFill`] records a `CodeGenerator` reports
    /// alongside a father into real, installable blocks.
    ///
    /// Sons don't carry their own hash/instruction metadata: validation
    /// always runs against `validation_root()`, which resolves to `father`,
    /// so a son's own `hash`/`guest_size` are never consulted. `native_size`
    /// is approximated as "from this son's offset to the end of the
    /// father's code region", since `SonFill` carries only an offset, not an
    /// independent length.
    fn new_son(
        guest_addr: GuestAddr,
        parent: DynablockListHandle,
        father: NonNull<Dynablock>,
        nolinker: bool,
        native_code: NativeAddr,
        native_size: usize,
    ) -> Self {
        let block = Self::new(guest_addr, parent, Some(father), nolinker);
        let state = FillState {
            guest_size: 0,
            native_code,
            native_size,
            hash: 0,
            instsize: Box::new([]),
            table: Box::new([]),
            sons: Vec::new(),
        };
        // SAFETY: `block` is a fresh, not-yet-shared value; this is its only
        // write to `fill` before it is handed to the caller.
        unsafe {
            *block.fill.get() = Some(state);
        }
        block.mark_done();
        block
    }

    /// Populates this freshly-installed block from a [`FillResult`]. Called
    /// exactly once, by the installer, between publication and the first
    /// dispatch edge referencing this block.
    ///
    /// Constructs and fills each reported son as a real `Dynablock`, parented
    /// to `self`; it is the caller's responsibility (see
    /// `crate::dispatch::Dispatcher`) to additionally publish each son into
    /// the owning directory's `direct[]` via
    /// [`crate::directory::DynablockList::install_son`], since `fill_with`
    /// itself has no directory access.
    pub(crate) fn fill_with(&self, result: FillResult) {
        let father = NonNull::from(self);
        let nolinker = self.nolinker();
        let sons = result
            .sons
            .into_iter()
            .map(|son_fill| {
                let native_size = result.native_size.saturating_sub(son_fill.native_offset);
                let native_code = NativeAddr(result.native_code.0 + son_fill.native_offset);
                let son = Self::new_son(
                    son_fill.guest_addr,
                    self.parent,
                    father,
                    nolinker,
                    native_code,
                    native_size,
                );
                AtomicPtr::new(Box::into_raw(Box::new(son)))
            })
            .collect();
        let state = FillState {
            guest_size: result.guest_size,
            native_code: result.native_code,
            native_size: result.native_size,
            hash: result.hash,
            instsize: result.instsize,
            table: result.table,
            sons,
        };
        // SAFETY: only the installer calls `fill_with`, exactly once, before
        // this block is referenced by any dispatch edge other than the
        // `direct[]` slot it was just published into (the documented hazard).
        unsafe {
            *self.fill.get() = Some(state);
        }
        self.mark_done();
    }

    fn fill(&self) -> Option<&FillState> {
        // SAFETY: readers only dereference `Some` state; a `None` here means
        // the installer hasn't finished yet (the documented hazard) and we
        // propagate that as "treat the block as not yet usable" to callers.
        unsafe { (*self.fill.get()).as_ref() }
    }

    /// Number of guest bytes this block covers, once filled.
    #[must_use]
    pub fn guest_size(&self) -> u32 {
        self.fill().map_or(0, |f| f.guest_size)
    }

    /// Native code pointer, once filled.
    #[must_use]
    pub fn native_code(&self) -> Option<NativeAddr> {
        self.fill().map(|f| f.native_code)
    }

    /// Native code length, once filled.
    #[must_use]
    pub fn native_size(&self) -> usize {
        self.fill().map_or(0, |f| f.native_size)
    }

    /// The hash recorded at fill time.
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.fill().map_or(0, |f| f.hash)
    }

    /// Whether this block's native code range contains `addr`. Used by
    /// `DynablockList::find` for reverse lookup.
    #[must_use]
    pub fn contains_native(&self, addr: NativeAddr) -> bool {
        self.fill()
            .is_some_and(|f| f.native_code.contains(f.native_size, addr))
    }

    /// Live sons of this block, as raw pointers (the non-null ones).
    pub(crate) fn sons(&self) -> &[AtomicPtr<Dynablock>] {
        self.fill().map_or(&[], |f| &f.sons)
    }

    /// Whether `free` has already run (or is running) for this block.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Atomically marks this block as gone. Returns `true` exactly once,
    /// for whichever caller actually wins the race; all other callers
    /// (including later calls from the same thread) see `false` and must
    /// treat `free` as already in progress.
    pub(crate) fn mark_gone(&self) -> bool {
        !self.gone.swap(true, Ordering::AcqRel)
    }

    /// Whether a hash re-check is due for this block's validation root.
    #[must_use]
    pub fn needs_test(&self) -> bool {
        self.need_test.load(Ordering::Acquire)
    }

    /// Requests a hash re-check on next entry. Only meaningful (and only
    /// ever called) on blocks with `nolinker() == true`.
    pub(crate) fn request_test(&self) {
        self.need_test.store(true, Ordering::Release);
    }

    /// Clears a pending hash re-check after a successful validation.
    pub(crate) fn clear_test(&self) {
        self.need_test.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Dynablock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dynablock")
            .field("guest_addr", &self.guest_addr)
            .field("gone", &self.is_gone())
            .field("need_test", &self.needs_test())
            .field("nolinker", &self.nolinker())
            .field("father", &self.father.is_some())
            .finish_non_exhaustive()
    }
}
