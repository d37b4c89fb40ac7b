//! Shared test wiring: a small `Config`/`Dynamap` builder used by every
//! integration test file. Kept deliberately thin — each test still builds
//! its own `Dispatcher` and collaborators inline, matching the flat,
//! one-file-per-subsystem layout the teacher kernel uses under its own
//! `tests/`.

#![allow(dead_code)]

use dynablocks::{Config, Dynamap};

/// A `Dynamap` with a small shard size, enough to cover the toy guest
/// address ranges (`0x1000`-ish) every test here uses.
pub fn small_dynamap() -> Dynamap {
    Dynamap::new(Config::new(12, 1 << 20, false))
}
