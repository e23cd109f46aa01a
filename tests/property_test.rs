//! Property-based tests for the checksum and queue invariants.

use proptest::prelude::*;
use quemar::{adler_memcpy, calculate_checksum, AdlerChecksum, PageEntry, PatternList};
use quemar_core::queue::{FineLockQueue, PageKind};
use quemar_core::telemetry::Step;

proptest! {
    #[test]
    fn prop_copy_checksum_equals_direct_checksum(
        seed in any::<u64>(),
        pairs in 1usize..256,
    ) {
        let src: Vec<u64> = (0..pairs * 2)
            .map(|i| seed.wrapping_mul(i as u64 + 1).wrapping_add(0x9e37_79b9))
            .collect();
        let mut dst = vec![0u64; src.len()];

        let mut copied = AdlerChecksum::default();
        adler_memcpy(&mut dst, &src, &mut copied).unwrap();

        let mut direct = AdlerChecksum::default();
        calculate_checksum(&src, &mut direct).unwrap();

        prop_assert_eq!(copied, direct);
        prop_assert_eq!(dst, src);
    }

    #[test]
    fn prop_checksum_detects_any_single_word_change(
        seed in any::<u64>(),
        index in 0usize..512,
        flip in 1u64..u64::MAX,
    ) {
        let mut data: Vec<u64> = (0..512)
            .map(|i| seed.wrapping_add(i).wrapping_mul(0x0123_4567_89ab_cdef))
            .collect();
        let mut clean = AdlerChecksum::default();
        calculate_checksum(&data, &mut clean).unwrap();

        data[index] ^= flip;
        let mut dirty = AdlerChecksum::default();
        calculate_checksum(&data, &mut dirty).unwrap();
        prop_assert_ne!(clean, dirty);
    }

    #[test]
    fn prop_single_valid_page_is_always_found(
        size in 1u64..128,
        target_seed in any::<u64>(),
    ) {
        let target = target_seed % size;
        let queue = FineLockQueue::new(size, 4096);
        for i in 0..size {
            queue.seed(i as usize, PageEntry::new(i * 4096)).unwrap();
        }

        let patterns = PatternList::new().unwrap();
        let step = Step::new("prop");

        // Mark exactly one page valid.
        loop {
            let mut handle = queue.take(PageKind::Empty, None, &step).unwrap();
            if handle.offset == target * 4096 {
                handle.pattern = Some(patterns.random_pattern());
                queue.put_valid(handle).unwrap();
                break;
            }
            queue.put_empty(handle);
        }

        // One full search cycle must find it, wherever it is.
        let found = queue.take(PageKind::Valid, None, &step).unwrap();
        prop_assert_eq!(found.offset, target * 4096);
    }

    #[test]
    fn prop_pattern_words_are_pure(index in any::<u32>()) {
        let patterns = PatternList::new().unwrap();
        for pattern in patterns.iter() {
            prop_assert_eq!(pattern.word(index), pattern.word(index));
        }
    }
}
