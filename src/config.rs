//! Runtime tunables for the cache.
//!
//! The original exposes these as preprocessor defines (`DYNAMAP_SHIFT`,
//! `DYNAMAP_SIZE`) and a global flipped by a command-line flag
//! (`box86_dynarec_dump`). We keep them as plain runtime fields so an
//! embedder can pick shard granularity without recompiling, but
//! `Config::from_env` mirrors the teacher's own pattern of reading tunables
//! from the environment at startup (see `option_env!("LOOP")` in the
//! teacher's `test_runner`).
use std::env;

/// log2 of the number of guest bytes covered by one address-space shard.
const DEFAULT_DYNAMAP_SHIFT: u32 = 16;

/// Configuration for a [`crate::addrspace::Dynamap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// log2 of the top-level shard size: shard index is `addr >> dynamap_shift`.
    pub dynamap_shift: u32,
    /// Number of top-level shards. Must cover the full 32-bit guest address
    /// space: `dynamap_size * (1 << dynamap_shift) >= 1 << 32` in the general
    /// case, though nothing here enforces that beyond `Dynamap` simply never
    /// being asked to index an address outside its own shard table.
    pub dynamap_size: usize,
    /// If set, `FillBlock`/`CodeGenerator::fill_block` invocations are
    /// serialized under a process-wide mutex, trading dispatch throughput for
    /// non-interleaved log output (mirrors `box86_dynarec_dump`).
    pub dynarec_dump: bool,
}

impl Config {
    /// Creates a [`Config`] with explicit values.
    #[must_use]
    pub fn new(dynamap_shift: u32, dynamap_size: usize, dynarec_dump: bool) -> Self {
        Self {
            dynamap_shift,
            dynamap_size,
            dynarec_dump,
        }
    }

    /// Builds the default configuration, with `dynarec_dump` taken from the
    /// `DYNAREC_DUMP` environment variable (any non-empty value enables it).
    #[must_use]
    pub fn from_env() -> Self {
        let dynamap_shift = env::var("DYNAMAP_SHIFT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DYNAMAP_SHIFT);
        let dynamap_size = env::var("DYNAMAP_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or_else(|| {
            1_usize
                .checked_shl(32 - dynamap_shift)
                .expect("dynamap_shift should leave room for at least one shard")
        });
        let dynarec_dump = env::var("DYNAREC_DUMP").is_ok_and(|v| !v.is_empty());
        Self::new(dynamap_shift, dynamap_size, dynarec_dump)
    }

    /// The top-level shard index for `addr`.
    #[must_use]
    pub fn shard_index(&self, addr: crate::addr::GuestAddr) -> usize {
        usize::try_from(addr.0 >> self.dynamap_shift).expect("shard index should fit in a usize")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
