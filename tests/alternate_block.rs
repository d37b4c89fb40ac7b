//! `get_alternate_block`'s splice-target retry (`spec.md` §4.6): on SMC
//! invalidation, the recreated block must still be translated from the
//! original `fill_addr`, not silently from `addr` — mirroring
//! `DBAlternateBlock`'s `internalDBGetBlock(emu, addr, filladdr, create,
//! NULL)` retry in `dynablock.c`, which never widens `filladdr` back to
//! `addr`.

mod common;

use dynablocks::addr::GuestAddr;
use dynablocks::config::Config;
use dynablocks::dispatch::Dispatcher;
use dynablocks::external::{IdentityCodeGenerator, MmapExecutableAllocator, MmapGuestMemory, NoFallback};
use dynablocks::hash::x31_hash;

#[test]
fn invalidation_retry_keeps_translating_from_fill_addr() {
    let _ = env_logger::try_init();

    let guest_mem = MmapGuestMemory::new(GuestAddr(0x5000), 0x1000);
    let addr = GuestAddr(0x5000);
    let fill_addr = GuestAddr(0x5010);

    // `addr` and `fill_addr` start out with identical bytes so the first
    // hash check (read from `addr`, per the original's own `x86_addr`-based
    // re-hash) matches what was translated from `fill_addr`.
    guest_mem.simulate_guest_write(addr, &[1, 2, 3, 4]);
    guest_mem.simulate_guest_write(fill_addr, &[1, 2, 3, 4]);

    let dynamap = common::small_dynamap();
    let dir = dynablocks::directory::DynablockList::new(addr, addr, 0x1000, true, true).unwrap();
    dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 4 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    let original = dispatcher
        .get_alternate_block(addr, fill_addr)
        .expect("block should be created");
    // SAFETY: `original` is a live block just returned by `get_alternate_block`.
    assert_eq!(unsafe { original.as_ref().hash() }, x31_hash(&[1, 2, 3, 4]));

    // Report a write overlapping `addr`'s own range (where the re-hash is
    // read from) without touching `fill_addr`'s bytes at all.
    dynamap
        .directory_for(addr)
        .expect("directory should be installed")
        .mark_range(addr, 4);
    guest_mem.simulate_guest_write(addr, &[9, 9, 9, 9]);

    let refreshed = dispatcher
        .get_alternate_block(addr, fill_addr)
        .expect("invalidation must still produce a fresh block");
    assert_ne!(
        refreshed.as_ptr(),
        original.as_ptr(),
        "a changed guest range must yield a new block identity"
    );
    // SAFETY: `refreshed` is a live block just returned by `get_alternate_block`.
    assert_eq!(
        unsafe { refreshed.as_ref().hash() },
        x31_hash(&[1, 2, 3, 4]),
        "the retry must still translate from fill_addr, not fall back to addr"
    );
}
