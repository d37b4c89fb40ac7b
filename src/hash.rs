//! The X31 hash used for self-modifying-code detection.
//!
//! Ported bit-for-bit from `X31_hash_code` in box86's
//! `src/dynarec/dynablock.c`. The hash is intentionally weak: it exists to
//! cheaply notice that a write-protected guest page changed between the
//! fault that set `need_test` and the next dispatch, not to defend against
//! an adversary. Do not replace it with a stronger hash; the page-protection
//! guard (`§4.5`) is what actually prevents missed writes, and a different
//! hash function would silently diverge from any externally recorded hash
//! values (translation dumps, golden test vectors) that assume this exact
//! function.

/// Computes the X31 hash of `bytes`.
///
/// Mirrors the original's `int32_t` accumulator (`h = (h << 5) - h + b`,
/// i.e. `31 * h + b`) with wrapping arithmetic, read back as a `u32`.
#[must_use]
pub fn x31_hash(bytes: &[u8]) -> u32 {
    let mut iter = bytes.iter();
    let Some(&first) = iter.next() else {
        return 0;
    };
    #[allow(clippy::cast_possible_wrap)]
    let mut h: i32 = first as i32;
    for &b in iter {
        #[allow(clippy::cast_possible_wrap)]
        let b = b as i32;
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(b);
    }
    #[allow(clippy::cast_sign_loss)]
    {
        h as u32
    }
}

#[cfg(test)]
mod tests {
    use super::x31_hash;

    #[test]
    fn empty_slice_hashes_to_zero() {
        assert_eq!(x31_hash(&[]), 0);
    }

    #[test]
    fn single_byte_is_itself() {
        assert_eq!(x31_hash(&[0x42]), 0x42);
    }

    #[test]
    fn matches_reference_values() {
        // 'a' = 0x61, 'b' = 0x62: h = 0x61, then h = 31*0x61 + 0x62 = 3089
        assert_eq!(x31_hash(b"ab"), 3089);
    }

    #[test]
    fn is_deterministic_and_order_sensitive() {
        assert_eq!(x31_hash(b"same bytes"), x31_hash(b"same bytes"));
        assert_ne!(x31_hash(b"abc"), x31_hash(b"cba"));
    }
}
