//! Dispatch / lookup (`C6` in `spec.md` §2): the fast/medium/slow lookup
//! path invoked on every guest branch, plus the SMC hash validation that
//! runs on every hit.
//!
//! Mirrors box86's `DBGetBlock`/`internalDBGetBlock`/`DBAlternateBlock`
//! (`examples/original_source/src/dynarec/dynablock.c`) function-for-function,
//! bundled into one `Dispatcher` so the "process-wide emulator context" the
//! original reaches for through a global (`my_context`, `emu->context`) is
//! instead an explicit handle threaded through every call, per `spec.md` §9's
//! design note.

use crate::addr::GuestAddr;
use crate::addrspace::Dynamap;
use crate::block::Dynablock;
use crate::config::Config;
use crate::directory::{free_dynablock, DynablockList};
use crate::external::{AddressSpaceFallback, CodeGenerator, ExecutableAllocator, GuestMemory};
use crate::hash::x31_hash;
use std::ptr::NonNull;
use std::sync::Mutex;

/// The explicit "emulator context" the dispatch path needs: the
/// address-space directory plus the four external collaborators
/// (`spec.md` §6). Constructed once per emulated process and passed to
/// every `get_block`/`get_alternate_block` call; nothing here is a global.
pub struct Dispatcher<'a> {
    config: Config,
    dynamap: &'a Dynamap,
    codegen: &'a dyn CodeGenerator,
    guest_memory: &'a dyn GuestMemory,
    allocator: &'a dyn ExecutableAllocator,
    fallback: &'a dyn AddressSpaceFallback,
    /// Serializes `FillBlock`/`fill_block` calls when `config.dynarec_dump`
    /// is set, matching the original's `mutex_dyndump` (`spec.md` §5).
    dump_mutex: Mutex<()>,
}

impl<'a> Dispatcher<'a> {
    /// Builds a dispatcher over the given address-space directory and
    /// external collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        dynamap: &'a Dynamap,
        codegen: &'a dyn CodeGenerator,
        guest_memory: &'a dyn GuestMemory,
        allocator: &'a dyn ExecutableAllocator,
        fallback: &'a dyn AddressSpaceFallback,
    ) -> Self {
        Self {
            config,
            dynamap,
            codegen,
            guest_memory,
            allocator,
            fallback,
            dump_mutex: Mutex::new(()),
        }
    }

    /// `spec.md` §4.6 `get_block`: fast path off `current`, then the
    /// medium/slow address-space lookups, installing and filling a fresh
    /// block if `create` and nothing was found, then validating the result
    /// and retrying once if SMC invalidation fires.
    pub fn get_block(
        &self,
        addr: GuestAddr,
        create: bool,
        current: Option<NonNull<Dynablock>>,
    ) -> Option<NonNull<Dynablock>> {
        let block = self.locate_or_create(addr, addr, create, current)?;
        self.validate(addr, addr, create, block)
    }

    /// `spec.md` §4.6 `get_alternate_block`: identical to `get_block` with
    /// `create = true` and no `current` hint, except the code generator is
    /// asked to translate as if entering at `fill_addr` rather than `addr`
    /// (used for splice targets).
    pub fn get_alternate_block(
        &self,
        addr: GuestAddr,
        fill_addr: GuestAddr,
    ) -> Option<NonNull<Dynablock>> {
        let block = self.locate_or_create(addr, fill_addr, true, None)?;
        self.validate(addr, fill_addr, true, block)
    }

    /// Reverse lookup: the block (or, for a son, its father) whose native
    /// code range contains `native_addr`. Diagnostics only, never on the hot
    /// path (`spec.md` §4.2, §6 `find_block_native`).
    #[must_use]
    pub fn find_block_native(&self, native_addr: crate::addr::NativeAddr) -> Option<NonNull<Dynablock>> {
        self.dynamap.with_directories(|dirs| {
            dirs.iter().find_map(|dir| dir.find(native_addr))
        })
    }

    fn locate_or_create(
        &self,
        target: GuestAddr,
        fill_addr: GuestAddr,
        create: bool,
        current: Option<NonNull<Dynablock>>,
    ) -> Option<NonNull<Dynablock>> {
        // 1. fast path: current block's own directory.
        if let Some(cur) = current {
            // SAFETY: callers only ever pass a `current` they themselves
            // still hold a live reference to.
            let cur_ref = unsafe { cur.as_ref() };
            let parent = cur_ref.parent();
            let dir = parent.get();
            if dir.contains(target) {
                if let Some(block) = dir.peek(target) {
                    return Some(block);
                }
                return self.create_in(dir, target, fill_addr, create);
            }
        }

        // 2. medium path: the address-space directory's own shard table.
        if let Some(dir) = self.dynamap.directory_for(target) {
            if let Some(block) = dir.peek(target) {
                return Some(block);
            }
            return self.create_in(dir, target, fill_addr, create);
        }

        // 3. slow path: the ELF-loader fallback.
        if let Some(dir) = self.fallback.lookup(target) {
            if let Some(block) = dir.peek(target) {
                return Some(block);
            }
            return self.create_in(dir, target, fill_addr, create);
        }

        None
    }

    fn create_in(
        &self,
        dir: &DynablockList,
        target: GuestAddr,
        fill_addr: GuestAddr,
        create: bool,
    ) -> Option<NonNull<Dynablock>> {
        let (block, created) = dir.add(target, create, self.dynamap, self.fallback);
        let block = block?;
        if created {
            self.fill(block, target, fill_addr);
        }
        Some(block)
    }

    /// Translates and populates a freshly installed block, then publishes
    /// its sons into whichever directory actually covers each son's
    /// address, then (for a `nolinker` top-level block) write-protects the
    /// guest range — mirroring the original's `FillBlock` call plus the
    /// implicit `ProtectDynablock` every first fill performs.
    fn fill(&self, block: NonNull<Dynablock>, target: GuestAddr, fill_addr: GuestAddr) {
        // SAFETY: `block` was just installed by `dir.add` and is not yet
        // referenced by any dispatch edge; we are the sole writer until
        // `fill_with` returns (`spec.md` §4.3).
        let block_ref = unsafe { block.as_ref() };

        let dump_guard = self.config.dynarec_dump.then(|| {
            self.dump_mutex
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        });
        let result = self
            .codegen
            .fill_block(target, fill_addr, self.guest_memory, self.allocator);
        let nolinker = block_ref.nolinker();
        let guest_addr = block_ref.guest_addr();
        let guest_size = result.guest_size;
        block_ref.fill_with(result);
        drop(dump_guard);

        for son_slot in block_ref.sons() {
            let ptr = son_slot.load(std::sync::atomic::Ordering::Acquire);
            let Some(son) = NonNull::new(ptr) else {
                continue;
            };
            // SAFETY: `son` was just constructed by `fill_with` and is not
            // yet reachable from any directory's `direct[]`.
            let son_ref = unsafe { son.as_ref() };
            if let Some(son_dir) = self.directory_for(son_ref.guest_addr()) {
                son_dir.install_son(son_ref.guest_addr(), son);
            }
        }

        if nolinker {
            self.guest_memory.protect(guest_addr, guest_size);
        }
    }

    fn directory_for(&self, addr: GuestAddr) -> Option<&DynablockList> {
        self.dynamap
            .directory_for(addr)
            .or_else(|| self.fallback.lookup(addr))
    }

    /// `spec.md` §4.5/§4.6: on a hit, checks whether the block's validation
    /// root (itself, or its father) needs a hash re-check, recomputes the
    /// X31 hash only for `nolinker` roots (mirroring the original's
    /// `father->nolinker ? X31_hash_code(...) : 0`), and either clears the
    /// flag and re-protects the page, or frees the root and retries once,
    /// re-entering `locate_or_create` with the same `fill_addr` the caller
    /// originally supplied — mirroring `DBGetBlock`/`DBAlternateBlock`, which
    /// both retry via `internalDBGetBlock(emu, addr, filladdr, create, ...)`
    /// rather than ever widening `filladdr` back to `addr`.
    fn validate(
        &self,
        addr: GuestAddr,
        fill_addr: GuestAddr,
        create: bool,
        block: NonNull<Dynablock>,
    ) -> Option<NonNull<Dynablock>> {
        // SAFETY: `block` was just produced by `locate_or_create`, which
        // only ever returns live blocks reachable via `direct[]`.
        let block_ref = unsafe { block.as_ref() };
        let root = block_ref.validation_root();
        // SAFETY: `validation_root` always resolves to a live block, per
        // `spec.md` §3.2 invariant 2.
        let root_ref = unsafe { root.as_ref() };

        if !root_ref.needs_test() {
            return Some(block);
        }

        let hash = if root_ref.nolinker() {
            let bytes = self.guest_memory.read(root_ref.guest_addr(), root_ref.guest_size());
            x31_hash(&bytes)
        } else {
            0
        };

        if hash == root_ref.hash() {
            root_ref.clear_test();
            self.guest_memory.protect(root_ref.guest_addr(), root_ref.guest_size());
            return Some(block);
        }

        log::debug!(
            "invalidating block at {} (hash {:#x} != stored {:#x})",
            root_ref.guest_addr(),
            hash,
            root_ref.hash()
        );
        free_dynablock(root, self.allocator);
        let fresh = self.locate_or_create(addr, fill_addr, create, None)?;
        self.validate(addr, fill_addr, create, fresh)
    }
}
