//! Error types surfaced by the cache.
//!
//! Per the original design, almost nothing here is a propagated error:
//! allocation failure, hash mismatch, double free, and lookup misses are
//! all recovered locally (see `spec.md` §7). The single real error is
//! attempting to create a directory over a zero-sized text region.

/// Errors that can be returned from the cache's public API.
#[derive(Debug, thiserror::Error)]
pub enum DynablockError {
    /// `DynablockList::new` was asked to cover a zero-byte region.
    #[error("cannot create a dynablock list with a zero-sized text region")]
    ZeroSizedRegion,
}
