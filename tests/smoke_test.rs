//! Smoke tests for basic functionality

use quemar::{calculate_checksum, AdlerChecksum, Config, PatternList, CRC_BLOCK_WORDS};

#[test]
fn test_version_exists() {
    // Verify the crate version string is valid semver
    let version = env!("CARGO_PKG_VERSION");
    assert!(!version.is_empty());
    let parts: Vec<&str> = version.split('.').collect();
    assert_eq!(parts.len(), 3, "Version should be semver: {version}");
}

#[test]
fn test_package_name() {
    let name = env!("CARGO_PKG_NAME");
    assert_eq!(name, "quemar");
}

#[test]
fn test_default_config_is_valid() {
    Config::default().validate().unwrap();
}

#[test]
fn test_pattern_catalog_builds() {
    let patterns = PatternList::new().unwrap();
    assert!(patterns.len() > 10);
    assert!(patterns.pattern(0).is_some());
}

#[test]
fn test_checksum_over_canonical_block() {
    let block = vec![0u64; CRC_BLOCK_WORDS];
    let mut sum = AdlerChecksum::default();
    calculate_checksum(&block, &mut sum).unwrap();
    assert_eq!(sum.to_hex().len(), 64);
}
