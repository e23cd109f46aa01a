//! Userspace DRAM, cache and CPU burn-in engine.
//!
//! quemar-core exercises a machine's memory subsystem and CPU cores
//! concurrently for a bounded wall-clock duration and reports detected
//! miscompares with enough context to localize the failing component:
//! virtual address, physical address, and DIMM label.
//!
//! The engine is built from a pattern catalog with precomputed rolling
//! checksums, a pool of pattern-labeled memory pages behind fine-grained
//! concurrent queues, and a family of worker tasks (fill, copy, invert,
//! check, CPU stress, cache-coherency probe, CPU-frequency probe)
//! coordinated by a pause/resume/stop controller.
//!
//! # Example
//!
//! ```no_run
//! use quemar_core::{Config, Engine};
//!
//! let config = Config {
//!     memory_mb: 256,
//!     runtime_seconds: 20,
//!     ..Config::default()
//! };
//! let mut engine = Engine::new(config).unwrap();
//! let report = engine.run().unwrap();
//! assert!(report.passed);
//! ```

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

mod checksum;
mod config;
mod engine;
mod error;
mod page;
mod pattern;
mod pool;
mod simd;
mod status;

pub mod os;
pub mod queue;
pub mod telemetry;
pub mod workers;

pub use checksum::{
    adler_memcpy, calculate_checksum, AdlerChecksum, CRC_BLOCK_SIZE, CRC_BLOCK_WORDS,
};
pub use config::{CacheCoherencyConfig, Config, CpuFreqConfig, RegionMode};
pub use engine::{Engine, RunReport};
pub use error::{Error, Result};
pub use page::{PageEntry, INVALID_TAG};
pub use pattern::{Pattern, PatternList};
pub use pool::{PageLease, PagePool};
pub use simd::CpuCaps;
pub use status::WorkerStatus;
