//! # quemar
//!
//! Userspace DRAM, cache and CPU burn-in harness with miscompare
//! localization.
//!
//! This is the workspace root crate that re-exports core functionality.
//! For direct usage, depend on individual sub-crates:
//!
//! - `quemar-core` - the verification engine (checksums, patterns, page
//!   queues, worker pool, hardware probes)
//! - `quemar-cli` - the `quemar` binary

pub use quemar_core::{
    adler_memcpy, calculate_checksum, AdlerChecksum, CacheCoherencyConfig, Config, CpuFreqConfig,
    Engine, Error, PageEntry, PatternList, RegionMode, Result, RunReport, WorkerStatus,
    CRC_BLOCK_SIZE, CRC_BLOCK_WORDS, INVALID_TAG,
};
