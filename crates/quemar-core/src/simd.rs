//! CPU capability probing and the SSE2-assisted warm copy path.
//!
//! The warm copy uses nontemporal stores so destination lines bypass the
//! cache hierarchy and hit DRAM directly; combined with the explicit
//! cacheline flushes in the copy workers this keeps the memory bus, not the
//! L2, as the component under test. On targets without SSE2 the scalar
//! [`crate::checksum::adler_memcpy`] substitutes and `warm` mode degrades to
//! `strict` mode.

use crate::checksum::AdlerChecksum;
use crate::{checksum, Result};

/// Cacheline size assumed by the flush helpers.
pub const CACHE_LINE_SIZE: usize = 64;

/// Detected CPU features relevant to the verification paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuCaps {
    /// SSE2 support (vector copy path).
    pub sse2: bool,
    /// CLFLUSH support (cacheline flush path).
    pub clflush: bool,
}

impl CpuCaps {
    /// Probe features on the current CPU.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            // CPUID.EAX=1: EDX bit 19 = CLFLUSH, bit 26 = SSE2.
            let leaf = unsafe { std::arch::x86_64::__cpuid(1) };
            Self {
                sse2: (leaf.edx >> 26) & 1 == 1,
                clflush: (leaf.edx >> 19) & 1 == 1,
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::default()
        }
    }

    /// Whether the vector copy path is usable.
    #[must_use]
    pub fn has_vector(&self) -> bool {
        self.sse2
    }
}

/// Flush the cacheline containing `addr` and fence.
#[inline]
pub fn flush(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: clflush has no alignment or validity requirements beyond a
    // mapped address, which the caller guarantees by owning the page.
    unsafe {
        std::arch::x86_64::_mm_clflush(addr);
        std::arch::x86_64::_mm_mfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Queue a cacheline flush without waiting for completion.
#[inline]
pub fn fast_flush_hint(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: as in `flush`.
    unsafe {
        std::arch::x86_64::_mm_clflush(addr);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
    }
}

/// Drain previously hinted flushes and pending nontemporal stores.
#[inline]
pub fn fast_flush_sync() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence is always safe to execute.
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// SSE2 copy with nontemporal stores, accumulating the Adler-4 checksum of
/// the data moved. Falls back to the scalar copy when the buffers are not
/// 16-byte aligned.
///
/// # Errors
///
/// Fails on the same length limits as [`checksum::adler_memcpy`].
#[cfg(target_arch = "x86_64")]
pub fn adler_memcpy_warm(
    dst: &mut [u64],
    src: &[u64],
    checksum_out: &mut AdlerChecksum,
) -> Result<()> {
    if dst.as_ptr() as usize % 16 != 0 || src.as_ptr() as usize % 16 != 0 {
        return checksum::adler_memcpy(dst, src, checksum_out);
    }
    // SAFETY: SSE2 is a baseline x86_64 feature; alignment checked above.
    unsafe { adler_memcpy_sse2(dst, src, checksum_out) }
}

/// Scalar substitute for targets without a vector unit.
#[cfg(not(target_arch = "x86_64"))]
pub fn adler_memcpy_warm(
    dst: &mut [u64],
    src: &[u64],
    checksum_out: &mut AdlerChecksum,
) -> Result<()> {
    checksum::adler_memcpy(dst, src, checksum_out)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn adler_memcpy_sse2(
    dst: &mut [u64],
    src: &[u64],
    checksum_out: &mut AdlerChecksum,
) -> Result<()> {
    use std::arch::x86_64::{_mm_loadu_si128, _mm_sfence, _mm_stream_si128, __m128i};

    if dst.len() != src.len() {
        return checksum::adler_memcpy(dst, src, checksum_out);
    }
    if src.len() >= (1 << 19) || src.len() % 2 != 0 {
        // Route length errors through the scalar path so the error values
        // stay uniform.
        return checksum::adler_memcpy(dst, src, checksum_out);
    }

    let mut a1: u64 = 1;
    let mut a2: u64 = 1;
    let mut b1: u64 = 0;
    let mut b2: u64 = 0;

    let src_ptr = src.as_ptr().cast::<__m128i>();
    let dst_ptr = dst.as_mut_ptr().cast::<__m128i>();
    let pairs = src.len() / 2;

    for i in 0..pairs {
        let v = _mm_loadu_si128(src_ptr.add(i));
        _mm_stream_si128(dst_ptr.add(i), v);

        let lanes: [u32; 4] = std::mem::transmute(v);
        a1 = a1.wrapping_add(u64::from(lanes[0]));
        b1 = b1.wrapping_add(a1);
        a1 = a1.wrapping_add(u64::from(lanes[1]));
        b1 = b1.wrapping_add(a1);
        a2 = a2.wrapping_add(u64::from(lanes[2]));
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(u64::from(lanes[3]));
        b2 = b2.wrapping_add(a2);
    }
    _mm_sfence();

    checksum_out.set(a1, a2, b1, b2);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{calculate_checksum, CRC_BLOCK_WORDS};

    #[test]
    fn test_detect_does_not_panic() {
        let caps = CpuCaps::detect();
        let _ = caps.has_vector();
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_x86_64_baseline_has_sse2() {
        assert!(CpuCaps::detect().sse2);
    }

    #[test]
    fn test_warm_copy_matches_scalar_checksum() {
        let src: Vec<u64> = (0..CRC_BLOCK_WORDS as u64)
            .map(|i| i.wrapping_mul(0x0123_4567_89ab_cdef))
            .collect();
        let mut dst = vec![0u64; CRC_BLOCK_WORDS];

        let mut warm = AdlerChecksum::default();
        adler_memcpy_warm(&mut dst, &src, &mut warm).unwrap();

        let mut scalar = AdlerChecksum::default();
        calculate_checksum(&src, &mut scalar).unwrap();

        assert_eq!(warm, scalar);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_flush_helpers_accept_any_mapped_address() {
        let data = [0u8; 64];
        flush(data.as_ptr());
        fast_flush_hint(data.as_ptr());
        fast_flush_sync();
    }
}
