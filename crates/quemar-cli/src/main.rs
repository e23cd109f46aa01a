//! quemar binary: command-line front end for the burn-in engine.

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]

mod output;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use quemar_core::{CacheCoherencyConfig, Config, CpuFreqConfig, Engine, RegionMode};
use tracing_subscriber::EnvFilter;

/// quemar: stress DRAM, caches and CPUs, and localize what breaks.
#[derive(Parser, Debug)]
#[command(name = "quemar")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Seconds to run the stress load.
    #[arg(short = 's', long, default_value_t = 20)]
    seconds: u64,

    /// Megabytes of memory to test; 0 sizes from free memory.
    #[arg(short = 'M', long, default_value_t = 0)]
    memory: u64,

    /// Megabytes to leave for the rest of the system when auto-sizing.
    #[arg(long, default_value_t = 0)]
    reserve_memory: u64,

    /// Minimum megabytes of hugepages to insist on.
    #[arg(short = 'H', long, default_value_t = 0)]
    hugepages: u64,

    /// Bytes per test page (power of two, at least 1024).
    #[arg(short = 'p', long, default_value_t = 1 << 20)]
    page_size: u64,

    /// Memory copy threads; negative auto-detects one per CPU.
    #[arg(short = 'm', long, default_value_t = -1)]
    memory_threads: i64,

    /// Memory invert threads.
    #[arg(short = 'i', long, default_value_t = 0)]
    invert_threads: u64,

    /// Mid-run memory check threads.
    #[arg(short = 'c', long, default_value_t = 0)]
    check_threads: u64,

    /// CPU stress threads.
    #[arg(short = 'C', long, default_value_t = 0)]
    cpu_stress_threads: u64,

    /// Startup fill threads.
    #[arg(long, default_value_t = 8)]
    fill_threads: u64,

    /// Fall back to the single-lock page queue (for comparison runs).
    #[arg(long)]
    coarse_grain_lock: bool,

    /// Skip CRC verification while copying.
    #[arg(short = 'F', long)]
    no_strict: bool,

    /// Use the SIMD warm copy to heat the CPU.
    #[arg(short = 'W', long)]
    warm: bool,

    /// Tag every cacheline with its own virtual address.
    #[arg(long)]
    tag_mode: bool,

    /// Stop early after this many errors; 0 keeps going.
    #[arg(long, default_value_t = 0)]
    max_errors: u64,

    /// Seconds between power-spike pauses.
    #[arg(long, default_value_t = 600)]
    pause_delay: u64,

    /// Seconds each power-spike pause lasts.
    #[arg(long, default_value_t = 15)]
    pause_duration: u64,

    /// Seconds between countdown log lines.
    #[arg(long, default_value_t = 10)]
    printsec: u64,

    /// Inject copy-path faults to self-test the miscompare machinery.
    #[arg(long)]
    force_errors: bool,

    /// Additionally mislabel pages on a schedule.
    #[arg(long)]
    force_errors_like_crazy: bool,

    /// Pin workers to CPUs local to the memory they touch.
    #[arg(long, conflicts_with = "remote_numa")]
    local_numa: bool,

    /// Pin workers to CPUs remote from the memory they touch.
    #[arg(long)]
    remote_numa: bool,

    /// Do not pin worker threads at all.
    #[arg(long)]
    no_affinity: bool,

    /// Record and print the physical ranges the test touched.
    #[arg(long)]
    do_page_map: bool,

    /// DIMM decode: address bits XOR-reduced to pick the channel.
    #[arg(long, default_value_t = 64)]
    channel_hash: u64,

    /// DIMM decode: channel width in bits.
    #[arg(long, default_value_t = 64)]
    channel_width: u64,

    /// DIMM decode: comma-separated chip names of one channel; repeat the
    /// flag once per channel.
    #[arg(long = "memory_channel")]
    memory_channels: Vec<String>,

    /// Run the cache-coherency probe on every core.
    #[arg(long)]
    cc_test: bool,

    /// Cache-coherency: number of cacheline records.
    #[arg(long, default_value_t = 2)]
    cc_line_count: usize,

    /// Cache-coherency: cacheline size override; 0 auto-detects.
    #[arg(long, default_value_t = 0)]
    cc_line_size: usize,

    /// Cache-coherency: increments per verification round.
    #[arg(long, default_value_t = 1000)]
    cc_inc_count: u64,

    /// Run the CPU-frequency probe.
    #[arg(long)]
    cpu_freq_test: bool,

    /// CPU-frequency: fail threshold in MHz.
    #[arg(long, default_value_t = 0)]
    cpu_freq_threshold: u32,

    /// CPU-frequency: rounding grain in MHz; 0 rounds to nearest.
    #[arg(long, default_value_t = 10)]
    cpu_freq_round: u32,

    /// Log verbosity: -v info (default), -vv debug, -vvv trace.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Report format.
    #[arg(long, default_value = "text")]
    format: output::OutputFormat,
}

impl Cli {
    fn into_config(self) -> Config {
        let region_mode = if self.local_numa {
            RegionMode::LocalNuma
        } else if self.remote_numa {
            RegionMode::RemoteNuma
        } else {
            RegionMode::None
        };

        let channels: Vec<Vec<String>> = self
            .memory_channels
            .iter()
            .map(|channel| channel.split(',').map(str::to_string).collect())
            .collect();

        Config {
            runtime_seconds: self.seconds,
            memory_mb: self.memory,
            reserve_mb: self.reserve_memory,
            hugepage_mb: self.hugepages,
            page_size_bytes: self.page_size,
            memory_threads: self.memory_threads,
            invert_threads: self.invert_threads,
            check_threads: self.check_threads,
            cpu_stress_threads: self.cpu_stress_threads,
            fill_threads: self.fill_threads,
            use_fine_grain_queue: !self.coarse_grain_lock,
            strict: !self.no_strict,
            warm: self.warm,
            tag_mode: self.tag_mode,
            max_errors: self.max_errors,
            pause_delay: self.pause_delay,
            pause_duration: self.pause_duration,
            print_delay: self.printsec,
            error_injection: self.force_errors || self.force_errors_like_crazy,
            crazy_error_injection: self.force_errors_like_crazy,
            region_mode,
            use_affinity: !self.no_affinity,
            do_page_map: self.do_page_map,
            channel_hash: self.channel_hash,
            channel_width: self.channel_width,
            channels,
            cache_coherency: CacheCoherencyConfig {
                enabled: self.cc_test,
                line_count: self.cc_line_count,
                line_size: self.cc_line_size,
                inc_count: self.cc_inc_count,
            },
            cpu_freq: CpuFreqConfig {
                enabled: self.cpu_freq_test,
                threshold_mhz: self.cpu_freq_threshold,
                round_mhz: self.cpu_freq_round,
            },
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("quemar={default},quemar_core={default}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> anyhow::Result<bool> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let format = cli.format;

    let config = cli.into_config();
    let mut engine = Engine::new(config).context("engine setup failed")?;
    let report = engine.run().context("run failed")?;

    output::print_report(&report, format)?;
    Ok(report.passed)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("quemar").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = parse(&[]).into_config();
        let stock = Config::default();
        assert_eq!(config.runtime_seconds, stock.runtime_seconds);
        assert_eq!(config.page_size_bytes, stock.page_size_bytes);
        assert_eq!(config.fill_threads, stock.fill_threads);
        assert_eq!(config.strict, stock.strict);
        assert_eq!(config.use_fine_grain_queue, stock.use_fine_grain_queue);
        assert_eq!(config.pause_delay, stock.pause_delay);
    }

    #[test]
    fn test_thread_flags() {
        let config = parse(&["-m", "4", "-i", "2", "-c", "1", "-C", "3"]).into_config();
        assert_eq!(config.memory_threads, 4);
        assert_eq!(config.invert_threads, 2);
        assert_eq!(config.check_threads, 1);
        assert_eq!(config.cpu_stress_threads, 3);
    }

    #[test]
    fn test_mode_flags() {
        let config =
            parse(&["-F", "-W", "--tag-mode", "--coarse-grain-lock", "--force-errors"])
                .into_config();
        assert!(!config.strict);
        assert!(config.warm);
        assert!(config.tag_mode);
        assert!(!config.use_fine_grain_queue);
        assert!(config.error_injection);
        assert!(!config.crazy_error_injection);
    }

    #[test]
    fn test_memory_channels_split() {
        let config = parse(&[
            "--memory_channel",
            "U1,U2,U3,U4",
            "--memory_channel",
            "U5,U6,U7,U8",
        ])
        .into_config();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0], vec!["U1", "U2", "U3", "U4"]);
    }

    #[test]
    fn test_numa_flags_conflict() {
        let result = Cli::try_parse_from(["quemar", "--local-numa", "--remote-numa"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_format_flag() {
        let cli = parse(&["--format", "json"]);
        assert!(matches!(cli.format, output::OutputFormat::Json));
        let cli = parse(&[]);
        assert!(matches!(cli.format, output::OutputFormat::Text));
    }

    #[test]
    fn test_probe_flags() {
        let config = parse(&[
            "--cc-test",
            "--cc-inc-count",
            "500",
            "--cpu-freq-test",
            "--cpu-freq-threshold",
            "1200",
        ])
        .into_config();
        assert!(config.cache_coherency.enabled);
        assert_eq!(config.cache_coherency.inc_count, 500);
        assert!(config.cpu_freq.enabled);
        assert_eq!(config.cpu_freq.threshold_mhz, 1200);
    }
}
