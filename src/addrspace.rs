//! The top-level address-space directory (`C1` in `spec.md` §2).
//!
//! Mirrors box86's `my_context->dynmap[]`: a fixed-size array of shards,
//! each either empty or pointing at the [`crate::directory::DynablockList`]
//! covering that chunk of the guest address space. `idx = addr >>
//! dynamap_shift` selects the shard; shards are installed once (at ELF
//! mapping time) and never reinstalled, which is what lets every read stay a
//! plain atomic/`OnceLock` load with no locking on the dispatch hot path.

use crate::addr::GuestAddr;
use crate::config::Config;
use crate::directory::{DynablockList, DynablockListHandle};
use crate::sync::SpinLock;
use crate::sync::SetOnce;
use std::ptr::NonNull;

/// The address-space directory: `Config::dynamap_size` shards, each
/// resolved by `addr >> Config::dynamap_shift`.
///
/// Directories are owned by an internal arena (a `Vec<Box<DynablockList>>`
/// behind a [`SpinLock`]) rather than by the shard slots themselves, since a
/// single directory's text region can span more than one shard: the arena
/// gives every directory a stable address that several shard slots can
/// independently reference via [`DynablockListHandle`].
pub struct Dynamap {
    config: Config,
    shards: Box<[SetOnce<DynablockListHandle>]>,
    arena: SpinLock<Vec<Box<DynablockList>>>,
}

impl Dynamap {
    /// Creates an empty address-space directory sized per `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let shards = (0..config.dynamap_size)
            .map(|_| SetOnce::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            config,
            shards,
            arena: SpinLock::new(Vec::new()),
        }
    }

    /// This directory's configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.config
    }

    /// Installs a freshly created directory, covering every shard its text
    /// region overlaps.
    ///
    /// Called by the loader at ELF mapping time, once per executable
    /// segment (`spec.md` §3.3). If two loader threads race to install
    /// overlapping regions, the later `try_set` for any already-occupied
    /// shard simply loses — `spec.md` §4.1 only promises slots aren't
    /// *reused*, not that installation itself is contended in practice, so
    /// losing silently (logged at debug) is adequate here.
    pub fn install_directory(&self, directory: Box<DynablockList>) -> DynablockListHandle {
        let start = directory.start();
        let end = directory.end();
        let ptr = {
            let mut arena = self.arena.lock();
            arena.push(directory);
            // SAFETY: the `Box` was just pushed into `arena` and is never
            // moved or dropped while `self` is alive; `arena`'s `Vec` may
            // reallocate its own backing storage, but that only relocates
            // the `Box` pointers, not the heap allocations they point to.
            NonNull::from(arena.last().expect("just pushed").as_ref())
        };
        let handle = DynablockListHandle::new(ptr);

        let start_shard = self.config.shard_index(start);
        let end_shard = self.config.shard_index(end);
        for shard in &self.shards[start_shard..=end_shard] {
            if shard.try_set(handle).is_err() {
                log::debug!("shard already occupied while installing directory at {start}");
            }
        }
        handle
    }

    /// Looks up the directory covering `addr`, if any shard has one
    /// installed.
    #[must_use]
    pub fn directory_for(&self, addr: GuestAddr) -> Option<&DynablockList> {
        let idx = self.config.shard_index(addr);
        let shard = self.shards.get(idx)?;
        Some(shard.get()?.get())
    }

    /// Iterates every installed directory, for diagnostics
    /// ([`crate::dispatch::Dispatcher::find_block_native`]) only — never on
    /// the dispatch hot path.
    pub(crate) fn with_directories<R>(&self, f: impl FnOnce(&[Box<DynablockList>]) -> R) -> R {
        let arena = self.arena.lock();
        f(&arena)
    }
}

// SAFETY: `Dynamap` only exposes shared (`&self`) access; all interior
// mutability goes through `SpinLock`/`SetOnce`, both already `Sync`.
unsafe impl Sync for Dynamap {}

#[cfg(test)]
mod tests {
    use super::Dynamap;
    use crate::addr::GuestAddr;
    use crate::config::Config;
    use crate::directory::DynablockList;

    #[test]
    fn directory_is_found_within_its_range() {
        let map = Dynamap::new(Config::new(12, 1 << 20, false));
        let dir = DynablockList::new(GuestAddr(0x1000), GuestAddr(0x1000), 0x1000, true, true)
            .expect("non-zero region");
        map.install_directory(dir);
        assert!(map.directory_for(GuestAddr(0x1500)).is_some());
        assert!(map.directory_for(GuestAddr(0x5000)).is_none());
    }

    #[test]
    fn directory_spanning_multiple_shards_is_found_in_each() {
        let map = Dynamap::new(Config::new(4, 1 << 28, false));
        // shard size is 16 bytes; a 64-byte region spans 4 shards.
        let dir = DynablockList::new(GuestAddr(0), GuestAddr(0), 64, true, true)
            .expect("non-zero region");
        map.install_directory(dir);
        for addr in [0_u32, 16, 32, 48, 63] {
            assert!(map.directory_for(GuestAddr(addr)).is_some());
        }
        assert!(map.directory_for(GuestAddr(64)).is_none());
    }
}
