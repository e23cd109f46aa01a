//! Run configuration.
//!
//! Filled in by an external parser (the CLI crate); validated here before
//! any memory is allocated or any worker starts.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Worker affinity strategy relative to memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegionMode {
    /// No region awareness.
    #[default]
    None,
    /// Pin workers to CPUs local to the pages they touch.
    LocalNuma,
    /// Pin workers to CPUs remote from the pages they touch.
    RemoteNuma,
}

/// Cache-coherency probe parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCoherencyConfig {
    /// Whether the probe runs.
    pub enabled: bool,
    /// Number of cacheline-sized records.
    pub line_count: usize,
    /// Cacheline size override; 0 auto-detects.
    pub line_size: usize,
    /// Increments per verification round.
    pub inc_count: u64,
}

impl Default for CacheCoherencyConfig {
    fn default() -> Self {
        Self { enabled: false, line_count: 2, line_size: 0, inc_count: 1000 }
    }
}

/// CPU-frequency probe parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuFreqConfig {
    /// Whether the probe runs.
    pub enabled: bool,
    /// Minimum acceptable per-core frequency in MHz.
    pub threshold_mhz: u32,
    /// Rounding grain for reported frequencies; 0 rounds to nearest MHz.
    pub round_mhz: u32,
}

impl Default for CpuFreqConfig {
    fn default() -> Self {
        Self { enabled: false, threshold_mhz: 0, round_mhz: 10 }
    }
}

/// Complete run configuration with the stock defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Wall-clock runtime bound in seconds.
    pub runtime_seconds: u64,
    /// Arena size in megabytes; 0 sizes from free memory.
    pub memory_mb: u64,
    /// Megabytes left to the system when auto-sizing.
    pub reserve_mb: u64,
    /// Minimum hugepage megabytes to insist on; 0 takes what exists.
    pub hugepage_mb: u64,
    /// Bytes per page; a power of two, at least 1024.
    pub page_size_bytes: u64,
    /// Memory copy workers; negative auto-detects one per CPU.
    pub memory_threads: i64,
    /// Memory invert workers.
    pub invert_threads: u64,
    /// Mid-run check workers.
    pub check_threads: u64,
    /// CPU stress workers.
    pub cpu_stress_threads: u64,
    /// Startup fill workers.
    pub fill_threads: u64,
    /// Queue flavor: per-slot locks (default) or single-lock rings.
    pub use_fine_grain_queue: bool,
    /// Verify checksums while copying.
    pub strict: bool,
    /// Use the SIMD warm copy.
    pub warm: bool,
    /// Tag every 64th byte with its own virtual address.
    pub tag_mode: bool,
    /// Stop early past this many errors; 0 disables.
    pub max_errors: u64,
    /// Seconds between power-spike pauses.
    pub pause_delay: u64,
    /// Seconds each pause lasts.
    pub pause_duration: u64,
    /// Seconds between countdown log lines.
    pub print_delay: u64,
    /// Inject faults in the copy path for self-test.
    pub error_injection: bool,
    /// Additionally corrupt pattern labels on a schedule.
    pub crazy_error_injection: bool,
    /// Worker affinity strategy.
    pub region_mode: RegionMode,
    /// Pin workers to CPUs at all.
    pub use_affinity: bool,
    /// Record and print the touched physical ranges.
    pub do_page_map: bool,
    /// DIMM decode: address bits XOR-reduced to pick the channel.
    pub channel_hash: u64,
    /// DIMM decode: channel width in bits.
    pub channel_width: u64,
    /// DIMM decode: chip names per channel; empty disables decode.
    pub channels: Vec<Vec<String>>,
    /// Cache-coherency probe parameters.
    pub cache_coherency: CacheCoherencyConfig,
    /// CPU-frequency probe parameters.
    pub cpu_freq: CpuFreqConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_seconds: 20,
            memory_mb: 0,
            reserve_mb: 0,
            hugepage_mb: 0,
            page_size_bytes: 1 << 20,
            memory_threads: -1,
            invert_threads: 0,
            check_threads: 0,
            cpu_stress_threads: 0,
            fill_threads: 8,
            use_fine_grain_queue: true,
            strict: true,
            warm: false,
            tag_mode: false,
            max_errors: 0,
            pause_delay: 600,
            pause_duration: 15,
            print_delay: 10,
            error_injection: false,
            crazy_error_injection: false,
            region_mode: RegionMode::None,
            use_affinity: true,
            do_page_map: false,
            channel_hash: 64,
            channel_width: 64,
            channels: Vec::new(),
            cache_coherency: CacheCoherencyConfig::default(),
            cpu_freq: CpuFreqConfig::default(),
        }
    }
}

impl Config {
    /// Check the configuration before any resource is committed.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] describing the first invalid option found.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size_bytes.is_power_of_two() || self.page_size_bytes < 1024 {
            return Err(Error::Config(format!(
                "page size must be a power of two of at least 1024 bytes, got {}",
                self.page_size_bytes
            )));
        }
        if self.runtime_seconds == 0 {
            return Err(Error::Config("runtime must be at least one second".to_string()));
        }
        if self.fill_threads == 0 {
            return Err(Error::Config("at least one fill thread is required".to_string()));
        }
        if self.warm && !self.strict {
            return Err(Error::Config(
                "warm copy implies strict verification; enable strict".to_string(),
            ));
        }
        if !self.channels.is_empty() {
            let modules = self.channels[0].len() as u64;
            if modules == 0 {
                return Err(Error::Config("memory channel with no modules".to_string()));
            }
            if self.channel_width < 8 {
                return Err(Error::Config(format!(
                    "channel width {} is narrower than one byte lane",
                    self.channel_width
                )));
            }
            if self.channels.iter().any(|c| c.len() as u64 != modules) {
                return Err(Error::Config(
                    "all memory channels must list the same module count".to_string(),
                ));
            }
            if self.channel_width % modules != 0 {
                return Err(Error::Config(format!(
                    "channel width {} must be a multiple of the module count {modules}",
                    self.channel_width
                )));
            }
        }
        if self.cache_coherency.enabled && self.cache_coherency.line_count == 0 {
            return Err(Error::Config(
                "cache coherency probe needs at least one cache line".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved memory worker count.
    #[must_use]
    pub fn resolved_memory_threads(&self, num_cpus: usize) -> u64 {
        if self.memory_threads < 0 {
            num_cpus as u64
        } else {
            self.memory_threads as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_page_size_must_be_power_of_two() {
        let config = Config { page_size_bytes: 3000, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_page_size_floor() {
        let config = Config { page_size_bytes: 512, ..Default::default() };
        assert!(config.validate().is_err());
        let config = Config { page_size_bytes: 1024, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_channel_width_multiple_of_modules() {
        let config = Config {
            channels: vec![
                vec!["U1".into(), "U2".into(), "U3".into()],
                vec!["U5".into(), "U6".into(), "U7".into()],
            ],
            channel_width: 64,
            ..Default::default()
        };
        // 64 bits over 3 modules does not divide evenly.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mismatched_channel_sizes_rejected() {
        let config = Config {
            channels: vec![vec!["U1".into(), "U2".into()], vec!["U5".into()]],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warm_without_strict_rejected() {
        let config = Config { warm: true, strict: false, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_threads_autodetect() {
        let config = Config::default();
        assert_eq!(config.resolved_memory_threads(8), 8);
        let config = Config { memory_threads: 2, ..Default::default() };
        assert_eq!(config.resolved_memory_threads(8), 2);
    }
}
