//! Four-lane Adler-style rolling checksum over 4 KiB blocks.
//!
//! The checksum walks 64-bit words as pairs of 32-bit halves. Even-indexed
//! words feed lane pair `(a1, b1)`, odd-indexed words feed `(a2, b2)`, each
//! as `a += half; b += a`. Splitting into two lane pairs keeps a data
//! dependency chain short enough that the sum can be computed at copy speed,
//! while a flipped bit anywhere in the block still perturbs every later `b`
//! term. Block boundaries are 4 KiB ([`CRC_BLOCK_SIZE`]) regardless of the
//! page size above them.

use crate::{Error, Result};

/// The granule over which checksums are computed, in bytes.
pub const CRC_BLOCK_SIZE: usize = 4096;

/// 64-bit words per CRC block.
pub const CRC_BLOCK_WORDS: usize = CRC_BLOCK_SIZE / 8;

/// Inputs at or beyond this many 64-bit words are rejected.
const MAX_CHECKSUM_WORDS: usize = 1 << 19;

/// A four-component rolling checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdlerChecksum {
    a1: u64,
    a2: u64,
    b1: u64,
    b2: u64,
}

impl AdlerChecksum {
    /// Create a checksum from its four components.
    #[must_use]
    pub fn from_parts(a1: u64, a2: u64, b1: u64, b2: u64) -> Self {
        Self { a1, a2, b1, b2 }
    }

    /// Set all four components.
    pub fn set(&mut self, a1: u64, a2: u64, b1: u64, b2: u64) {
        *self = Self { a1, a2, b1, b2 };
    }

    /// Canonical hex form: the four components concatenated in
    /// `a1 a2 b1 b2` order.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!(
            "{:016x}{:016x}{:016x}{:016x}",
            self.a1, self.a2, self.b1, self.b2
        )
    }
}

impl std::fmt::Display for AdlerChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Running lane state shared by the checksum and copy loops.
struct Lanes {
    a1: u64,
    a2: u64,
    b1: u64,
    b2: u64,
}

impl Lanes {
    fn new() -> Self {
        Self { a1: 1, a2: 1, b1: 0, b2: 0 }
    }

    #[inline(always)]
    fn even(&mut self, word: u64) {
        self.a1 = self.a1.wrapping_add(word & 0xffff_ffff);
        self.b1 = self.b1.wrapping_add(self.a1);
        self.a1 = self.a1.wrapping_add(word >> 32);
        self.b1 = self.b1.wrapping_add(self.a1);
    }

    #[inline(always)]
    fn odd(&mut self, word: u64) {
        self.a2 = self.a2.wrapping_add(word & 0xffff_ffff);
        self.b2 = self.b2.wrapping_add(self.a2);
        self.a2 = self.a2.wrapping_add(word >> 32);
        self.b2 = self.b2.wrapping_add(self.a2);
    }

    fn finish(self, checksum: &mut AdlerChecksum) {
        checksum.set(self.a1, self.a2, self.b1, self.b2);
    }
}

fn check_length(data: &[u64]) -> Result<()> {
    if data.len() >= MAX_CHECKSUM_WORDS {
        return Err(Error::ChecksumLength { words: data.len() });
    }
    if data.len() % 2 != 0 {
        return Err(Error::Internal(format!(
            "checksum input must be an even number of words, got {}",
            data.len()
        )));
    }
    Ok(())
}

/// Calculate the Adler-4 checksum of `data`.
///
/// The checksum is left untouched on error.
///
/// # Errors
///
/// Fails when `data` is at least 2^19 words long or has odd length.
pub fn calculate_checksum(data: &[u64], checksum: &mut AdlerChecksum) -> Result<()> {
    check_length(data)?;

    let mut lanes = Lanes::new();
    for pair in data.chunks_exact(2) {
        lanes.even(pair[0]);
        lanes.odd(pair[1]);
    }
    lanes.finish(checksum);
    Ok(())
}

/// Copy `src` into `dst` while accumulating the checksum of the data moved.
///
/// Produces the same checksum as [`calculate_checksum`] over `src`, and
/// leaves `dst == src`.
///
/// # Errors
///
/// Fails when the buffers differ in length, or on the length limits of
/// [`calculate_checksum`].
pub fn adler_memcpy(dst: &mut [u64], src: &[u64], checksum: &mut AdlerChecksum) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::Internal(format!(
            "adler_memcpy length mismatch: dst {} words, src {} words",
            dst.len(),
            src.len()
        )));
    }
    check_length(src)?;

    let mut lanes = Lanes::new();
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        lanes.even(s[0]);
        d[0] = s[0];
        lanes.odd(s[1]);
        d[1] = s[1];
    }
    lanes.finish(checksum);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(fill: impl Fn(usize) -> u64) -> Vec<u64> {
        (0..CRC_BLOCK_WORDS).map(fill).collect()
    }

    #[test]
    fn test_block_constants() {
        assert_eq!(CRC_BLOCK_SIZE, 4096);
        assert_eq!(CRC_BLOCK_WORDS, 512);
    }

    #[test]
    fn test_checksum_deterministic() {
        let data = block(|i| i as u64 * 0x9e37_79b9);
        let mut a = AdlerChecksum::default();
        let mut b = AdlerChecksum::default();
        calculate_checksum(&data, &mut a).unwrap();
        calculate_checksum(&data, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_checksum_detects_single_bit_flip() {
        let mut data = block(|_| 0x5555_5555_5555_5555);
        let mut clean = AdlerChecksum::default();
        calculate_checksum(&data, &mut clean).unwrap();

        data[511] ^= 1;
        let mut dirty = AdlerChecksum::default();
        calculate_checksum(&data, &mut dirty).unwrap();
        assert_ne!(clean, dirty);
    }

    #[test]
    fn test_checksum_length_limit() {
        let data = vec![0u64; MAX_CHECKSUM_WORDS];
        let mut sum = AdlerChecksum::from_parts(1, 2, 3, 4);
        let err = calculate_checksum(&data, &mut sum).unwrap_err();
        assert!(matches!(err, Error::ChecksumLength { .. }));
        // Untouched on failure.
        assert_eq!(sum, AdlerChecksum::from_parts(1, 2, 3, 4));
    }

    #[test]
    fn test_checksum_rejects_odd_length() {
        let data = vec![0u64; 3];
        let mut sum = AdlerChecksum::default();
        assert!(calculate_checksum(&data, &mut sum).is_err());
    }

    #[test]
    fn test_adler_memcpy_matches_checksum() {
        let src = block(|i| (i as u64).wrapping_mul(0xdead_beef_cafe_f00d));
        let mut dst = vec![0u64; CRC_BLOCK_WORDS];

        let mut copy_sum = AdlerChecksum::default();
        adler_memcpy(&mut dst, &src, &mut copy_sum).unwrap();

        let mut direct_sum = AdlerChecksum::default();
        calculate_checksum(&src, &mut direct_sum).unwrap();

        assert_eq!(copy_sum, direct_sum);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_adler_memcpy_length_mismatch() {
        let src = vec![0u64; 4];
        let mut dst = vec![0u64; 2];
        let mut sum = AdlerChecksum::default();
        assert!(adler_memcpy(&mut dst, &src, &mut sum).is_err());
    }

    #[test]
    fn test_hex_form_is_stable() {
        let sum = AdlerChecksum::from_parts(1, 2, 3, 4);
        assert_eq!(
            sum.to_hex(),
            "0000000000000001000000000000000200000000000000030000000000000004"
        );
        assert_eq!(format!("{sum}"), sum.to_hex());
    }

    #[test]
    fn test_lane_order_matters() {
        // Swapping two adjacent words moves data between lanes; the
        // checksum must notice.
        let mut data = block(|i| i as u64);
        let mut a = AdlerChecksum::default();
        calculate_checksum(&data, &mut a).unwrap();

        data.swap(10, 11);
        let mut b = AdlerChecksum::default();
        calculate_checksum(&data, &mut b).unwrap();
        assert_ne!(a, b);
    }
}
