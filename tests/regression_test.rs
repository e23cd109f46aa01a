//! Regression tests for known edge cases and pinned behaviors.

use quemar::{calculate_checksum, AdlerChecksum, Config, PageEntry, PatternList};
use quemar_core::queue::CoarseQueue;

#[test]
fn test_checksum_known_values() {
    // Hand-computed lane values for a tiny input; pins the lane order and
    // the a/b update rule.
    let data = vec![1u64, 2, 3, 4];
    let mut sum = AdlerChecksum::default();
    calculate_checksum(&data, &mut sum).unwrap();
    assert_eq!(sum, AdlerChecksum::from_parts(5, 7, 14, 20));
}

#[test]
fn test_checksum_zero_block_hex() {
    let data = vec![0u64; 4];
    let mut sum = AdlerChecksum::default();
    calculate_checksum(&data, &mut sum).unwrap();
    assert_eq!(
        sum.to_hex(),
        "0000000000000001000000000000000100000000000000040000000000000004"
    );
}

#[test]
fn test_walking_ones_shape() {
    // The walking bit climbs, peaks twice at the top, and descends.
    let patterns = PatternList::new().unwrap();
    let walking = patterns.iter().find(|p| p.name() == "walkingOnes").unwrap();
    assert_eq!(walking.word(0), 0x0000_0001);
    assert_eq!(walking.word(1), 0x0000_0002);
    assert_eq!(walking.word(31), 0x8000_0000);
    assert_eq!(walking.word(32), 0x8000_0000);
    assert_eq!(walking.word(63), 0x0000_0001);
    // Period 64.
    assert_eq!(walking.word(64), walking.word(0));
}

#[test]
fn test_coarse_ring_sentinel_slot() {
    // Capacity N means the N+1-sized ring accepts exactly N pushes; the
    // sentinel slot stays free so in == out still means empty.
    let queue = CoarseQueue::new(3);
    assert!(queue.push(PageEntry::new(0)));
    assert!(queue.push(PageEntry::new(4096)));
    assert!(queue.push(PageEntry::new(8192)));
    assert!(!queue.push(PageEntry::new(12288)));
    assert_eq!(queue.len(), 3);
}

#[test]
fn test_empty_channel_config_disables_dimm_decode() {
    // No channels configured must validate cleanly (decode is optional).
    let config = Config { channels: Vec::new(), ..Config::default() };
    config.validate().unwrap();
}

#[test]
fn test_minimum_page_size_boundary() {
    let config = Config { page_size_bytes: 1024, ..Config::default() };
    assert!(config.validate().is_ok());
    let config = Config { page_size_bytes: 1023, ..Config::default() };
    assert!(config.validate().is_err());
}
