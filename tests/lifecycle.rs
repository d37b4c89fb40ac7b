//! Scenarios 1 and 2 from `spec.md` §8, plus P7 (idempotent free).

mod common;

use dynablocks::addr::GuestAddr;
use dynablocks::config::Config;
use dynablocks::directory::{free_dynablock, DynablockList};
use dynablocks::dispatch::Dispatcher;
use dynablocks::external::{IdentityCodeGenerator, MmapExecutableAllocator, MmapGuestMemory, NoFallback};

/// Scenario 1: *simple create/lookup*. A repeated call for the same address
/// returns the exact same block, not a fresh one.
#[test]
fn simple_create_then_lookup_returns_same_block() {
    let guest_mem = MmapGuestMemory::new(GuestAddr(0x1000), 0x1000);
    guest_mem.simulate_guest_write(GuestAddr(0x1000), &[1, 2, 3, 4]);

    let dynamap = common::small_dynamap();
    let dir = DynablockList::new(GuestAddr(0), GuestAddr(0x1000), 0x1000, true, true)
        .expect("non-zero text region");
    dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 4 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    let first = dispatcher
        .get_block(GuestAddr(0x1000), true, None)
        .expect("block should be created");
    // SAFETY: `first` was just returned live from `get_block`.
    assert_eq!(unsafe { first.as_ref().guest_addr() }, GuestAddr(0x1000));

    let second = dispatcher
        .get_block(GuestAddr(0x1000), true, None)
        .expect("block should already exist");
    assert_eq!(first.as_ptr(), second.as_ptr());
}

/// A lookup with `create = false` against an empty slot returns `None`
/// rather than installing anything (`spec.md` §7 error kind 6).
#[test]
fn lookup_without_create_misses_cleanly() {
    let guest_mem = MmapGuestMemory::new(GuestAddr(0x1000), 0x1000);
    let dynamap = common::small_dynamap();
    let dir = DynablockList::new(GuestAddr(0), GuestAddr(0x1000), 0x1000, true, true).unwrap();
    let handle = dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 4 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    assert!(dispatcher.get_block(GuestAddr(0x1000), false, None).is_none());
    assert!(handle.get().peek(GuestAddr(0x1000)).is_none());
}

/// Scenario 2: *eviction by range*. A write into a block's guest bytes,
/// reported via `mark_range`, causes the next `get_block` at that address to
/// free the stale block and install a fresh one with a different identity.
#[test]
fn write_after_mark_range_produces_a_fresh_block() {
    let guest_mem = MmapGuestMemory::new(GuestAddr(0x1000), 0x1000);
    guest_mem.simulate_guest_write(GuestAddr(0x1000), &[1, 2, 3, 4]);

    let dynamap = common::small_dynamap();
    let dir = DynablockList::new(GuestAddr(0), GuestAddr(0x1000), 0x1000, true, true).unwrap();
    let handle = dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 4 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    let original = dispatcher.get_block(GuestAddr(0x1000), true, None).unwrap();

    // Simulate a guest write changing the translated bytes, then the fault
    // handler reporting it.
    guest_mem.simulate_guest_write(GuestAddr(0x1000), &[9, 9, 9, 9]);
    handle.get().mark_range(GuestAddr(0x1000), 4);

    let refreshed = dispatcher.get_block(GuestAddr(0x1000), true, None).unwrap();
    assert_ne!(
        original.as_ptr(),
        refreshed.as_ptr(),
        "a changed guest page must yield a new block identity"
    );
    // SAFETY: `refreshed` is a live block just returned by `get_block`.
    assert!(!unsafe { refreshed.as_ref().needs_test() });
}

/// `mark_range` with no actual byte change leaves the existing block in
/// place, with `need_test` cleared after the (successful) re-hash.
#[test]
fn mark_range_without_a_real_write_keeps_the_same_block() {
    let guest_mem = MmapGuestMemory::new(GuestAddr(0x1000), 0x1000);
    guest_mem.simulate_guest_write(GuestAddr(0x1000), &[1, 2, 3, 4]);

    let dynamap = common::small_dynamap();
    let dir = DynablockList::new(GuestAddr(0), GuestAddr(0x1000), 0x1000, true, true).unwrap();
    let handle = dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 4 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    let original = dispatcher.get_block(GuestAddr(0x1000), true, None).unwrap();

    handle.get().mark_range(GuestAddr(0x1000), 4);
    let same = dispatcher.get_block(GuestAddr(0x1000), true, None).unwrap();

    assert_eq!(original.as_ptr(), same.as_ptr());
    // SAFETY: `same` is a live block just returned by `get_block`.
    assert!(!unsafe { same.as_ref().needs_test() });
}

/// P7: after `free_dynablock`, the block's slot is gone from its directory
/// and a subsequent `get_block` installs a brand new one rather than ever
/// reusing the freed pointer — the safe, externally observable half of
/// idempotent free. (The other half — that re-entering `free` on a still-
/// live, not-yet-deallocated reference is a no-op — is exercised directly
/// against `Dynablock::mark_gone` in `src/block.rs`'s own unit tests, since
/// calling `free_dynablock` again on a pointer it has already dropped would
/// itself be a use-after-free in the test, not just in the code under test.)
#[test]
fn freed_block_is_gone_from_its_directory() {
    let guest_mem = MmapGuestMemory::new(GuestAddr(0x1000), 0x1000);
    guest_mem.simulate_guest_write(GuestAddr(0x1000), &[1, 2, 3, 4]);

    let dynamap = common::small_dynamap();
    let dir = DynablockList::new(GuestAddr(0), GuestAddr(0x1000), 0x1000, true, true).unwrap();
    let handle = dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 4 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    let block = dispatcher.get_block(GuestAddr(0x1000), true, None).unwrap();
    free_dynablock(block, &allocator);

    assert!(handle.get().peek(GuestAddr(0x1000)).is_none());
    let fresh = dispatcher.get_block(GuestAddr(0x1000), true, None).unwrap();
    assert_ne!(fresh.as_ptr(), block.as_ptr());
}

/// Creating a directory over a zero-sized text region fails cleanly
/// (`spec.md` §7 error kind 2).
#[test]
fn zero_sized_region_is_rejected() {
    let err = DynablockList::new(GuestAddr(0), GuestAddr(0x1000), 0, true, true)
        .expect_err("a zero-sized text region must be rejected");
    assert!(matches!(
        err,
        dynablocks::error::DynablockError::ZeroSizedRegion
    ));
}
