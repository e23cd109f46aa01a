//! The catalog of data patterns pages are filled with and verified against.
//!
//! Each pattern is a short repeating sequence of 32-bit words chosen to
//! stress a different failure mode: walking bits catch stuck-at and
//! coupling faults, checkerboards catch address decoder faults, solid
//! values catch stuck bits, and the low-transition 8b10b-style values keep
//! the bus in its worst signal-integrity regime. Sequence lengths are
//! powers of two so `word(i)` is a masked table lookup, reproducible from
//! the index alone. Structured patterns also get an inverted twin (`~`
//! suffix).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::checksum::{calculate_checksum, AdlerChecksum, CRC_BLOCK_WORDS};
use crate::Result;

/// One deterministic data pattern with its precomputed block checksum.
#[derive(Debug)]
pub struct Pattern {
    name: String,
    data: Box<[u32]>,
    mask: u32,
    invert: u32,
    weight: u32,
    crc: AdlerChecksum,
}

impl Pattern {
    fn build(name: String, data: Vec<u32>, inverted: bool, weight: u32) -> Result<Self> {
        debug_assert!(data.len().is_power_of_two());
        let mut pattern = Self {
            name,
            mask: data.len() as u32 - 1,
            data: data.into_boxed_slice(),
            invert: if inverted { 0xffff_ffff } else { 0 },
            weight,
            crc: AdlerChecksum::default(),
        };

        // Fill one canonical CRC block the way the fill workers do and
        // remember its checksum.
        let mut block = vec![0u64; CRC_BLOCK_WORDS];
        for (i, word) in block.iter_mut().enumerate() {
            let lo = u64::from(pattern.word(2 * i as u32));
            let hi = u64::from(pattern.word(2 * i as u32 + 1));
            *word = lo | (hi << 32);
        }
        let mut crc = AdlerChecksum::default();
        calculate_checksum(&block, &mut crc)?;
        pattern.crc = crc;
        Ok(pattern)
    }

    /// The 32-bit value this pattern takes at `index`.
    #[inline]
    #[must_use]
    pub fn word(&self, index: u32) -> u32 {
        self.data[(index & self.mask) as usize] ^ self.invert
    }

    /// Human-readable pattern name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checksum of one canonical 4 KiB block filled with this pattern.
    #[must_use]
    pub fn crc(&self) -> &AdlerChecksum {
        &self.crc
    }

    /// Relative selection weight in the catalog.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// A pattern table: name, repeating data, weight, whether an inverted twin
/// is worth having.
struct PatternDef {
    name: &'static str,
    data: fn() -> Vec<u32>,
    weight: u32,
    invertible: bool,
}

fn walking_ones() -> Vec<u32> {
    let up = (0..32).map(|i| 1u32 << i);
    let down = (0..32).map(|i| 1u32 << (31 - i));
    up.chain(down).collect()
}

fn walking_inv_ones() -> Vec<u32> {
    (0..32).flat_map(|i| [1u32 << i, !(1u32 << i)]).collect()
}

fn one_zero() -> Vec<u32> {
    vec![0xffff_ffff, 0x0000_0000]
}

fn just_zero() -> Vec<u32> {
    vec![0x0000_0000]
}

fn just_one() -> Vec<u32> {
    vec![0xffff_ffff]
}

fn just_five() -> Vec<u32> {
    vec![0x5555_5555]
}

fn just_a() -> Vec<u32> {
    vec![0xaaaa_aaaa]
}

fn checkerboard() -> Vec<u32> {
    vec![0x5555_5555, 0xaaaa_aaaa]
}

fn five_seven() -> Vec<u32> {
    vec![0x5555_5557, 0x5557_5555, 0x5555_5557, 0x5755_5555]
}

fn zero_2fd() -> Vec<u32> {
    vec![0x0002_0002, 0x0002_0002, 0xfffd_fffd, 0xfffd_fffd]
}

fn long_8b10b() -> Vec<u32> {
    vec![0x1616_1616]
}

fn short_8b10b() -> Vec<u32> {
    vec![0xb5b5_b5b5]
}

fn checker_8b10b() -> Vec<u32> {
    vec![0xb5b5_b5b5, 0x4a4a_4a4a]
}

// The inverted twin of `walkingOnes` plays the walking-zeros role; listing
// walking zeros separately would give the block-corruption analysis two
// names for the same word sequence.
const PATTERN_DEFS: &[PatternDef] = &[
    PatternDef { name: "walkingOnes", data: walking_ones, weight: 3, invertible: true },
    PatternDef { name: "walkingInvOnes", data: walking_inv_ones, weight: 3, invertible: true },
    PatternDef { name: "oneZero", data: one_zero, weight: 2, invertible: false },
    PatternDef { name: "justZero", data: just_zero, weight: 1, invertible: false },
    PatternDef { name: "justOne", data: just_one, weight: 1, invertible: false },
    PatternDef { name: "justFive", data: just_five, weight: 1, invertible: false },
    PatternDef { name: "justA", data: just_a, weight: 1, invertible: false },
    PatternDef { name: "checkerboard", data: checkerboard, weight: 2, invertible: false },
    PatternDef { name: "five7", data: five_seven, weight: 1, invertible: true },
    PatternDef { name: "zero2fd", data: zero_2fd, weight: 1, invertible: true },
    PatternDef { name: "long8b10b", data: long_8b10b, weight: 2, invertible: true },
    PatternDef { name: "short8b10b", data: short_8b10b, weight: 2, invertible: true },
    PatternDef { name: "checker8b10b", data: checker_8b10b, weight: 2, invertible: true },
];

// 64-bit LCG constants shared with the page queue's slot generators.
const RAND_MUL: u64 = 2_862_933_555_777_941_757;
const RAND_INC: u64 = 3_037_000_493;

/// The read-only catalog of every pattern, with weighted random selection.
#[derive(Debug)]
pub struct PatternList {
    patterns: Vec<Arc<Pattern>>,
    total_weight: u32,
    seed: AtomicU64,
}

impl PatternList {
    /// Construct every pattern and precompute its block checksum.
    ///
    /// # Errors
    ///
    /// Fails if a pattern's canonical block checksum cannot be computed.
    pub fn new() -> Result<Self> {
        let mut patterns = Vec::with_capacity(PATTERN_DEFS.len() * 2);
        for def in PATTERN_DEFS {
            let data = (def.data)();
            patterns.push(Arc::new(Pattern::build(
                def.name.to_string(),
                data.clone(),
                false,
                def.weight,
            )?));
            if def.invertible {
                patterns.push(Arc::new(Pattern::build(
                    format!("{}~", def.name),
                    data,
                    true,
                    def.weight,
                )?));
            }
        }
        let total_weight = patterns.iter().map(|p| p.weight()).sum();
        Ok(Self { patterns, total_weight, seed: AtomicU64::new(0xbeef) })
    }

    /// Number of patterns in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the catalog is empty (it never is after construction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The i-th pattern, for deterministic replay.
    #[must_use]
    pub fn pattern(&self, index: usize) -> Option<&Arc<Pattern>> {
        self.patterns.get(index)
    }

    /// Iterate over every pattern in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pattern>> {
        self.patterns.iter()
    }

    /// A weight-biased uniformly seeded random pattern.
    #[must_use]
    pub fn random_pattern(&self) -> Arc<Pattern> {
        let r = self
            .seed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(s.wrapping_mul(RAND_MUL).wrapping_add(RAND_INC))
            })
            .unwrap_or(0xbeef);
        let mut pick = (r % u64::from(self.total_weight)) as u32;
        for pattern in &self.patterns {
            if pick < pattern.weight() {
                return Arc::clone(pattern);
            }
            pick -= pattern.weight();
        }
        // Unreachable: weights sum to total_weight.
        Arc::clone(&self.patterns[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_is_nonempty_and_named_uniquely() {
        let list = PatternList::new().unwrap();
        assert!(!list.is_empty());
        let names: HashSet<&str> = list.iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), list.len());
    }

    #[test]
    fn test_word_is_reproducible_from_index() {
        let list = PatternList::new().unwrap();
        for pattern in list.iter() {
            for i in 0..256 {
                assert_eq!(pattern.word(i), pattern.word(i));
            }
        }
    }

    #[test]
    fn test_word_repeats_with_mask_period() {
        let list = PatternList::new().unwrap();
        let p = list.pattern(0).unwrap();
        let period = p.mask + 1;
        for i in 0..period {
            assert_eq!(p.word(i), p.word(i + period));
        }
    }

    #[test]
    fn test_inverted_twin_is_complement() {
        let list = PatternList::new().unwrap();
        let base = list.iter().find(|p| p.name() == "walkingOnes").unwrap();
        let twin = list.iter().find(|p| p.name() == "walkingOnes~").unwrap();
        for i in 0..128 {
            assert_eq!(base.word(i), !twin.word(i));
        }
    }

    #[test]
    fn test_precomputed_crc_matches_filled_block() {
        let list = PatternList::new().unwrap();
        for pattern in list.iter() {
            let block: Vec<u64> = (0..CRC_BLOCK_WORDS)
                .map(|i| {
                    let lo = u64::from(pattern.word(2 * i as u32));
                    let hi = u64::from(pattern.word(2 * i as u32 + 1));
                    lo | (hi << 32)
                })
                .collect();
            let mut crc = AdlerChecksum::default();
            calculate_checksum(&block, &mut crc).unwrap();
            assert_eq!(&crc, pattern.crc(), "pattern {}", pattern.name());
        }
    }

    #[test]
    fn test_random_pattern_covers_catalog() {
        let list = PatternList::new().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            seen.insert(list.random_pattern().name().to_string());
        }
        // Weighted choice over thousands of draws should hit most entries.
        assert!(seen.len() > list.len() / 2);
    }

    #[test]
    fn test_pattern_index_out_of_range() {
        let list = PatternList::new().unwrap();
        assert!(list.pattern(list.len()).is_none());
    }

    #[test]
    fn test_solid_patterns_are_solid() {
        let list = PatternList::new().unwrap();
        let zero = list.iter().find(|p| p.name() == "justZero").unwrap();
        let one = list.iter().find(|p| p.name() == "justOne").unwrap();
        for i in 0..64 {
            assert_eq!(zero.word(i), 0);
            assert_eq!(one.word(i), 0xffff_ffff);
        }
    }
}
