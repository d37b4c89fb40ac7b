//! Scenario 6 from `spec.md` §8: mapping a native-code address back to the
//! block that owns it.

mod common;

use dynablocks::addr::{GuestAddr, NativeAddr};
use dynablocks::config::Config;
use dynablocks::directory::DynablockList;
use dynablocks::dispatch::Dispatcher;
use dynablocks::external::{IdentityCodeGenerator, MmapExecutableAllocator, MmapGuestMemory, NoFallback};

#[test]
fn find_block_native_resolves_an_address_inside_the_code_region() {
    let guest_mem = MmapGuestMemory::new(GuestAddr(0x4000), 0x1000);
    guest_mem.simulate_guest_write(GuestAddr(0x4000), &[1, 2, 3, 4, 5, 6, 7, 8]);

    let dynamap = common::small_dynamap();
    let dir = DynablockList::new(GuestAddr(0), GuestAddr(0x4000), 0x1000, true, true).unwrap();
    dynamap.install_directory(dir);

    let codegen = IdentityCodeGenerator { block_len: 8 };
    let allocator = MmapExecutableAllocator;
    let fallback = NoFallback;
    let config = Config::new(12, 1 << 20, false);
    let dispatcher = Dispatcher::new(config, &dynamap, &codegen, &guest_mem, &allocator, &fallback);

    let block = dispatcher.get_block(GuestAddr(0x4000), true, None).unwrap();
    // SAFETY: `block` is a live block just returned by `get_block`.
    let native = unsafe { block.as_ref().native_code() }.expect("block should be filled");

    let found = dispatcher
        .find_block_native(NativeAddr(native.0 + 2))
        .expect("an address inside the code region should resolve");
    assert_eq!(found.as_ptr(), block.as_ptr());

    assert!(
        dispatcher
            .find_block_native(NativeAddr(native.0.wrapping_sub(0x1000)))
            .is_none(),
        "an address far outside any block's code region must miss"
    );
}
