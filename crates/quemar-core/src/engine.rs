//! The test orchestrator: arena setup, page initialization, worker
//! launch, the run-loop schedules, teardown, and final verification.
//!
//! The engine exclusively owns the arena, the page pool, the pattern
//! catalog, and the worker handles; workers receive shared read handles
//! and scoped page leases, never a reference back to the engine.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::config::{Config, RegionMode};
use crate::os::{self, DramMap, OsLayer};
use crate::page::{PageEntry, INVALID_TAG};
use crate::pattern::PatternList;
use crate::pool::PagePool;
use crate::status::WorkerStatus;
use crate::telemetry::{Diagnosis, Severity, Step, PROCESS_ERROR};
use crate::workers::{
    cache_coherency::{CacheCoherencyWorker, CcArena},
    check::CheckWorker,
    copy::CopyWorker,
    cpu_freq::{self, CpuFreqWorker},
    cpu_stress::CpuStressWorker,
    fill::FillWorker,
    invert::InvertWorker,
    spawn_worker, Worker, WorkerContext, WorkerHandle, WorkerKind,
};
use crate::{Error, Result};

const MEGABYTE: u64 = 1024 * 1024;

/// Main-loop cadence in seconds.
const SLEEP_FREQUENCY_S: u64 = 5;
/// Seconds between crazy-injection events.
const INJECTION_FREQUENCY_S: u64 = 10;

// The one piece of process-global state: the signal handler's flag.
static USER_BREAK: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_break(_signum: i32) {
    USER_BREAK.store(true, Ordering::Relaxed);
}

/// Next time an action on a fixed frequency should occur. Working from
/// the schedule's start instead of the previous occurrence avoids drift.
fn next_occurrence(frequency: u64, start: u64, now: u64) -> u64 {
    start + frequency + ((now - start) / frequency) * frequency
}

/// Append-only bitmap of touched physical 4 KiB pages.
struct TouchedPageMap {
    bits: Vec<AtomicU8>,
    span_bytes: u64,
}

impl TouchedPageMap {
    fn new(span_bytes: u64) -> Self {
        let bits = (0..span_bytes / 4096 / 8).map(|_| AtomicU8::new(0)).collect();
        Self { bits, span_bytes }
    }

    /// Mark every 4 KiB page of a mapped test page. Idempotent, so races
    /// between workers are benign, but the set must still be atomic.
    fn update(&self, os: &OsLayer, vaddr: usize, page_len: usize, step: &Step) {
        for sub in (0..page_len).step_by(4096) {
            let paddr = os.virtual_to_physical(vaddr + sub);
            if paddr == 0 {
                continue;
            }
            let index = (paddr / 4096 / 8) as usize;
            if index >= self.bits.len() {
                step.add_error(
                    PROCESS_ERROR,
                    format!(
                        "physical address {paddr:#x} is beyond the expected limit {:#x}",
                        self.span_bytes
                    ),
                );
                continue;
            }
            self.bits[index].fetch_or(1 << ((paddr / 4096) % 8), Ordering::Relaxed);
        }
    }

    /// Log the contiguous physical ranges the run touched.
    fn print(&self, step: &Step) {
        step.log(Severity::Info, "physical memory ranges touched by this run:");
        let pages = self.span_bytes / 4096;
        let mut range_start = 0u64;
        let mut in_range = false;
        for page in 0..pages {
            let touched = self.bits[(page / 8) as usize].load(Ordering::Relaxed)
                & (1 << (page % 8))
                != 0;
            if touched && !in_range {
                in_range = true;
                range_start = page * 4096;
            } else if !touched && in_range {
                in_range = false;
                step.log(
                    Severity::Info,
                    format!("{range_start:#016x} - {:#016x}", page * 4096 - 1),
                );
            }
        }
        step.log(Severity::Info, "done printing physical memory ranges");
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Pages in the arena.
    pub pages: u64,
    /// Total miscompare count across every worker, including the final
    /// drain.
    pub error_count: u64,
    /// Fail diagnoses emitted.
    pub failed_diagnoses: u64,
    /// Process (software) errors recorded.
    pub process_errors: u64,
    /// Total memory traffic generated, in megabytes.
    pub total_data_mb: f64,
    /// Aggregate bandwidth in MB/s.
    pub total_bandwidth_mb_s: f64,
    /// Every diagnosis from every step, for inspection.
    pub diagnoses: Vec<Diagnosis>,
    /// Whether the run passed: no miscompares, no fail diagnoses, and no
    /// software faults.
    pub passed: bool,
}

/// The burn-in engine.
pub struct Engine {
    config: Config,
    os: Arc<OsLayer>,
    patterns: Arc<PatternList>,
    pool: Arc<PagePool>,
    pages: u64,
    freepages: u64,
    region_pages: [u64; 32],
    region_mask: u32,
    regions_in_use: u32,
    power_spike_status: Arc<WorkerStatus>,
    continuous_status: Arc<WorkerStatus>,
    page_map: Option<TouchedPageMap>,
    steps: Vec<Step>,
    total_threads: usize,
}

impl Engine {
    /// Validate the configuration, probe the machine, allocate the arena,
    /// and initialize every page: seeded empty, filled by fill workers,
    /// then region-tagged and split into the valid and free sets.
    ///
    /// # Errors
    ///
    /// Setup failures: invalid configuration, allocation failure, or a
    /// fill worker reporting a software error.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let setup_step = Step::new("Setup and Check Environment");
        let dram = if config.channels.is_empty() {
            None
        } else {
            Some(DramMap {
                channel_hash: config.channel_hash,
                channel_width: config.channel_width,
                channels: config.channels.clone(),
            })
        };
        let os = Arc::new(OsLayer::new(dram, &setup_step)?);

        let size = Self::arena_bytes(&config, &os)?;
        let pages = size / config.page_size_bytes;
        if pages == 0 {
            return Err(Error::Config(format!(
                "arena of {size} bytes holds no {}-byte pages",
                config.page_size_bytes
            )));
        }
        setup_step.add_measurement("Memory to Test", "MB", (size / MEGABYTE) as f64);
        setup_step.add_measurement("Test Run Time", "s", config.runtime_seconds as f64);

        let mem = Arc::new(os.allocate_test_mem(
            size as usize,
            config.hugepage_mb * MEGABYTE,
            &setup_step,
        )?);
        let patterns = Arc::new(PatternList::new()?);

        let pool = Arc::new(if config.use_fine_grain_queue {
            PagePool::fine(pages, config.page_size_bytes, Arc::clone(&mem))
        } else {
            PagePool::coarse(pages, config.page_size_bytes, Arc::clone(&mem))
        });

        let mut engine = Self {
            config,
            os,
            patterns,
            pool,
            pages,
            freepages: 0,
            region_pages: [0; 32],
            region_mask: 0,
            regions_in_use: 0,
            power_spike_status: Arc::new(WorkerStatus::new()),
            continuous_status: Arc::new(WorkerStatus::new()),
            page_map: None,
            steps: vec![setup_step],
            total_threads: 0,
        };
        engine.initialize_pages()?;
        Ok(engine)
    }

    /// Arena size in bytes: configured, or sized from free memory.
    fn arena_bytes(config: &Config, os: &OsLayer) -> Result<u64> {
        let page = config.page_size_bytes;
        let bytes = if config.memory_mb > 0 {
            config.memory_mb * MEGABYTE
        } else {
            let free = os.find_free_mem_bytes();
            let reserve = config.reserve_mb * MEGABYTE;
            // Leave headroom for the harness itself when auto-sizing.
            (free.saturating_sub(reserve)) / 20 * 19
        };
        let bytes = bytes / page * page;
        if bytes == 0 {
            return Err(Error::Config(
                "not enough free memory for even one test page".to_string(),
            ));
        }
        Ok(bytes)
    }

    fn track_step(&mut self, step: Step) -> Step {
        self.steps.push(step.clone());
        step
    }

    /// Pages reserved empty so takers always find a destination.
    fn required_free_pages(&self) -> u64 {
        let needed = self.config.resolved_memory_threads(self.os.num_cpus())
            + self.config.invert_threads
            + self.config.check_threads;
        if self.config.use_fine_grain_queue {
            // The fine queue mixes valid and empty entries in one array;
            // random traversal wants a fuller empty set.
            self.pages / 5 * 2
        } else {
            self.pages / 100 + 2 * needed
        }
    }

    fn initialize_pages(&mut self) -> Result<()> {
        let fill_step = self.track_step(Step::new("Setup and Fill Memory Pages"));
        fill_step.add_measurement("Total Memory Page Count", "pages", self.pages as f64);

        let needed = self.config.resolved_memory_threads(self.os.num_cpus())
            + self.config.invert_threads
            + self.config.check_threads;
        self.freepages = self.required_free_pages();
        fill_step.add_measurement("Free Memory Page Count", "pages", self.freepages as f64);

        if self.freepages < needed {
            return Err(Error::Config(format!(
                "free page count {} cannot satisfy {} worker threads; grow the arena or \
                 reduce the thread counts",
                self.freepages, needed
            )));
        }
        if self.freepages > self.pages / 2 {
            return Err(Error::Config(format!(
                "free page count {} exceeds half the {} total pages",
                self.freepages, self.pages
            )));
        }

        // Park every page descriptor, empty and untagged.
        for i in 0..self.pages {
            self.pool
                .seed(i as usize, PageEntry::new(i * self.config.page_size_bytes))?;
        }

        // Fill every page with a pattern, in parallel.
        let fill_status = Arc::new(WorkerStatus::new());
        let mut fill_workers: Vec<(Box<dyn Worker>, WorkerContext)> = Vec::new();
        let fill_threads = self.config.fill_threads;
        for i in 0..fill_threads {
            let quota = if i == fill_threads - 1 {
                self.pages - self.pages / fill_threads * i
            } else {
                self.pages / fill_threads
            };
            fill_step.log(
                Severity::Debug,
                format!("starting memory page fill thread {i} to fill {quota} pages"),
            );
            let ctx = self.worker_context(
                WorkerKind::Fill,
                Arc::clone(&fill_status),
                fill_step.clone(),
            );
            fill_workers.push((Box::new(FillWorker::new(quota)), ctx));
        }

        fill_status.initialize();
        let handles: Vec<WorkerHandle> = fill_workers
            .into_iter()
            .map(|(worker, ctx)| spawn_worker(worker, ctx))
            .collect();
        for handle in handles {
            let thread_num = handle.thread_num;
            if !handle.join() {
                return Err(Error::Internal(format!(
                    "memory page fill thread {thread_num} failed; see error logs"
                )));
            }
        }
        fill_step.log(Severity::Debug, "done filling memory pages, assigning regions");

        if self.config.do_page_map {
            self.page_map = Some(TouchedPageMap::new(self.os.find_free_mem_bytes() * 4));
        }

        // Resolve each page's physical address, classify it into a region,
        // and split the pool into its valid and free sets.
        for i in 0..self.pages {
            let Ok(mut lease) = self.pool.take_valid(Some(INVALID_TAG), &fill_step) else {
                fill_step.add_error(
                    PROCESS_ERROR,
                    format!(
                        "error allocating pages: {} of {} assigned before the pool ran dry",
                        i, self.pages
                    ),
                );
                return Err(Error::Internal("page region assignment failed".to_string()));
            };

            let paddr = self.os.virtual_to_physical(lease.vaddr);
            let region = self.os.find_region(paddr);
            self.region_pages[region as usize % 32] += 1;
            lease.paddr = paddr;
            lease.tag = 1 << region;
            self.region_mask |= lease.tag;

            if let Some(map) = &self.page_map {
                map.update(&self.os, lease.vaddr, self.config.page_size_bytes as usize, &fill_step);
            }

            // Random takes spread the free pages across regions well
            // enough once the counts are in the thousands.
            if i < self.freepages {
                self.pool.put_empty(lease)?;
            } else {
                self.pool.put_valid(lease)?;
            }
        }

        if let Some(map) = &self.page_map {
            map.print(&fill_step);
        }

        for region in 0..32 {
            if self.region_mask & (1 << region) != 0 {
                self.regions_in_use += 1;
                fill_step.log(
                    Severity::Debug,
                    format!("region {region} holds {} pages", self.region_pages[region]),
                );
            }
        }
        fill_step.log(Severity::Debug, format!("region mask: {:#x}", self.region_mask));
        Ok(())
    }

    fn worker_context(
        &mut self,
        kind: WorkerKind,
        status: Arc<WorkerStatus>,
        step: Step,
    ) -> WorkerContext {
        let thread_num = self.total_threads;
        self.total_threads += 1;
        WorkerContext::new(
            thread_num,
            kind,
            &self.config,
            Arc::clone(&self.pool),
            Arc::clone(&self.patterns),
            Arc::clone(&self.os),
            status,
            step,
        )
    }

    /// The i-th region that actually holds pages.
    fn region_find(&self, index: u32) -> u32 {
        let mut remaining = index;
        for region in 0..32 {
            if self.region_mask & (1 << region) != 0 {
                if remaining == 0 {
                    return region;
                }
                remaining -= 1;
            }
        }
        0
    }

    /// Interleaved core for the n-th worker: even cores first, odd cores
    /// on the second lap, so paired SMT siblings are used last.
    fn alternating_core(nth: usize, cores: usize) -> usize {
        ((2 * nth) % cores + ((2 * nth) / cores) % 2) % cores
    }

    fn build_workers(&mut self) -> Vec<(Box<dyn Worker>, WorkerContext)> {
        let mut workers: Vec<(Box<dyn Worker>, WorkerContext)> = Vec::new();
        let available = os::available_cpus();
        let cores = os::cpuset_count(&available);
        let memory_threads = self.config.resolved_memory_threads(self.os.num_cpus());
        let cpu_stress_threads = self.config.cpu_stress_threads;

        // Memory copy workers, with NUMA placement when asked for.
        if memory_threads > 0 {
            let copy_step = self.track_step(Step::new("Run Memory Copy Threads"));
            for i in 0..memory_threads {
                let mut ctx = self.worker_context(
                    WorkerKind::Copy,
                    Arc::clone(&self.power_spike_status),
                    copy_step.clone(),
                );

                if self.regions_in_use > 1 && self.config.region_mode != RegionMode::None {
                    let region = self.region_find(i as u32 % self.regions_in_use);
                    ctx.cpu_mask = Some(self.os.find_core_mask(region));
                    ctx.tag = match self.config.region_mode {
                        RegionMode::LocalNuma => Some(1 << region),
                        RegionMode::RemoteNuma => Some(self.region_mask & !(1 << region)),
                        RegionMode::None => None,
                    };
                } else if (cpu_stress_threads + memory_threads) as usize <= cores {
                    let core = Self::alternating_core(i as usize, cores);
                    ctx.cpu_mask = Some(os::cpuset_range(core, core + 1));
                }
                workers.push((Box::new(CopyWorker::new(i)), ctx));
            }
        }

        // Mid-run check workers.
        if self.config.check_threads > 0 {
            let check_step = self.track_step(Step::new("Run Mid-Test Memory Check Threads"));
            for _ in 0..self.config.check_threads {
                let ctx = self.worker_context(
                    WorkerKind::Check,
                    Arc::clone(&self.continuous_status),
                    check_step.clone(),
                );
                workers.push((Box::new(CheckWorker), ctx));
            }
        }

        // Memory invert workers.
        if self.config.invert_threads > 0 {
            let invert_step = self.track_step(Step::new("Run Memory Invert Threads"));
            for _ in 0..self.config.invert_threads {
                let ctx = self.worker_context(
                    WorkerKind::Invert,
                    Arc::clone(&self.continuous_status),
                    invert_step.clone(),
                );
                workers.push((Box::new(InvertWorker), ctx));
            }
        }

        // CPU stress workers, placed from the top cores down so they
        // interleave with the copy workers.
        if cpu_stress_threads > 0 {
            let stress_step = self.track_step(Step::new("Run CPU Stress Threads"));
            for i in 0..cpu_stress_threads {
                let mut ctx = self.worker_context(
                    WorkerKind::CpuStress,
                    Arc::clone(&self.continuous_status),
                    stress_step.clone(),
                );
                if (cpu_stress_threads + memory_threads) as usize <= cores {
                    let nth = cores - 1 - (i as usize % cores);
                    let core = Self::alternating_core(nth, cores);
                    ctx.cpu_mask = Some(os::cpuset_range(core, core + 1));
                }
                workers.push((Box::new(CpuStressWorker), ctx));
            }
        }

        // Cache-coherency probe: one worker pinned to every core.
        if self.config.cache_coherency.enabled {
            let cc_step = self.track_step(Step::new("Run CPU Cache Coherency Test"));
            let line_size = if self.config.cache_coherency.line_size > 0 {
                self.config.cache_coherency.line_size
            } else {
                self.os.cache_line_size()
            };
            cc_step.add_measurement("Cache Line Size", "bytes", line_size as f64);

            let num_cpus = self.os.num_cpus();
            match CcArena::new(self.config.cache_coherency.line_count, line_size, num_cpus) {
                Ok(arena) => {
                    let arena = Arc::new(arena);
                    for cpu in 0..num_cpus {
                        let mut ctx = self.worker_context(
                            WorkerKind::CacheCoherency,
                            Arc::clone(&self.continuous_status),
                            cc_step.clone(),
                        );
                        ctx.cpu_mask = Some(os::cpuset_range(cpu, cpu + 1));
                        workers.push((
                            Box::new(CacheCoherencyWorker::new(
                                Arc::clone(&arena),
                                cpu,
                                num_cpus,
                                self.config.cache_coherency.inc_count,
                            )),
                            ctx,
                        ));
                    }
                }
                Err(e) => {
                    cc_step.add_error(PROCESS_ERROR, format!("cache coherency setup failed: {e}"));
                }
            }
        }

        // CPU-frequency probe: a single sampling worker, paused along with
        // the power-spike group so idle dips are not misread.
        if self.config.cpu_freq.enabled {
            let freq_step = self.track_step(Step::new("Run CPU Frequency Test"));
            if cpu_freq::can_run(&freq_step) {
                let ctx = self.worker_context(
                    WorkerKind::CpuFreq,
                    Arc::clone(&self.power_spike_status),
                    freq_step.clone(),
                );
                workers.push((
                    Box::new(CpuFreqWorker::new(
                        self.os.num_cpus(),
                        self.config.cpu_freq.threshold_mhz,
                        self.config.cpu_freq.round_mhz,
                        Arc::new(os::DevMsr),
                    )),
                    ctx,
                ));
            }
        }

        workers
    }

    /// Run the configured workload for the configured wall-clock bound.
    ///
    /// # Errors
    ///
    /// Software failures only; hardware findings land in the report.
    pub fn run(&mut self) -> Result<RunReport> {
        let run_step = self.track_step(Step::new("Run Test Threads"));
        USER_BREAK.store(false, Ordering::Relaxed);

        // Block the break signals before spawning so every worker inherits
        // the blocked mask, leaving the orchestrator thread as the only
        // receiver.
        let mut break_signals = SigSet::empty();
        break_signals.add(Signal::SIGINT);
        break_signals.add(Signal::SIGTERM);
        let mut previous_mask = SigSet::empty();
        let masked = signal::pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&break_signals),
            Some(&mut previous_mask),
        )
        .is_ok();

        let action = SigAction::new(SigHandler::Handler(handle_break), SaFlags::empty(), SigSet::empty());
        // SAFETY: the handler only stores to an atomic flag.
        let previous_actions = unsafe {
            (
                signal::sigaction(Signal::SIGINT, &action).ok(),
                signal::sigaction(Signal::SIGTERM, &action).ok(),
            )
        };

        let workers = self.build_workers();
        self.power_spike_status.initialize();
        self.continuous_status.initialize();
        run_step.log(
            Severity::Debug,
            format!("spawning {} worker threads", workers.len()),
        );
        let handles: Vec<WorkerHandle> = workers
            .into_iter()
            .map(|(worker, ctx)| spawn_worker(worker, ctx))
            .collect();

        if masked {
            let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous_mask), None);
        }

        self.main_loop(&run_step, &handles);

        // Teardown: stop everything and reap.
        run_step.log(Severity::Debug, "joining worker threads");
        self.power_spike_status.stop_workers();
        self.continuous_status.stop_workers();

        let mut error_count = 0u64;
        let mut kind_stats = Vec::new();
        for handle in handles {
            let kind = handle.kind;
            let stats = Arc::clone(&handle.stats);
            if !handle.join() {
                run_step.add_error(
                    PROCESS_ERROR,
                    format!("a {} exited with a software failure", kind.type_name()),
                );
            }
            error_count += stats.errors.load(Ordering::Relaxed);
            kind_stats.push((kind, stats));
        }

        self.pool.analyze(&run_step);
        error_count += self.final_check();
        self.run_analysis(&kind_stats);

        // Put the signal plumbing back the way it was.
        // SAFETY: restoring previously observed dispositions.
        unsafe {
            if let (Some(int_action), _) = &previous_actions {
                let _ = signal::sigaction(Signal::SIGINT, int_action);
            }
            if let (_, Some(term_action)) = &previous_actions {
                let _ = signal::sigaction(Signal::SIGTERM, term_action);
            }
        }

        let failed_diagnoses: u64 = self.steps.iter().map(Step::fail_count).sum();
        let process_errors: u64 = self.steps.iter().map(Step::error_count).sum();
        let diagnoses: Vec<Diagnosis> =
            self.steps.iter().flat_map(Step::diagnoses).collect();
        let (total_data_mb, total_bandwidth_mb_s) = Self::totals(&kind_stats, self.config.page_size_bytes as usize);

        Ok(RunReport {
            pages: self.pages,
            error_count,
            failed_diagnoses,
            process_errors,
            total_data_mb,
            total_bandwidth_mb_s,
            diagnoses,
            passed: error_count == 0 && failed_diagnoses == 0 && process_errors == 0,
        })
    }

    fn main_loop(&self, run_step: &Step, handles: &[WorkerHandle]) {
        let start = Instant::now();
        let end_s = self.config.runtime_seconds;
        run_step.log(
            Severity::Debug,
            format!("starting countdown with {end_s} seconds"),
        );

        let mut next_print = self.config.print_delay;
        let mut next_pause = self.config.pause_delay;
        let mut next_resume = 0u64;
        let mut next_injection = if self.config.crazy_error_injection {
            INJECTION_FREQUENCY_S
        } else {
            0
        };

        let mut now_s = 0u64;
        while now_s < end_s {
            let seconds_remaining = end_s - now_s;

            if USER_BREAK.load(Ordering::Relaxed) {
                run_step.log(
                    Severity::Info,
                    format!("user exiting early with {seconds_remaining} seconds remaining"),
                );
                break;
            }

            if self.config.max_errors != 0 {
                let errors: u64 = handles
                    .iter()
                    .map(|h| h.stats.errors.load(Ordering::Relaxed))
                    .sum();
                if errors > self.config.max_errors {
                    run_step.log(
                        Severity::Error,
                        format!(
                            "exiting early with {seconds_remaining} seconds remaining after \
                             {errors} errors"
                        ),
                    );
                    break;
                }
            }

            if self.config.print_delay != 0 && now_s >= next_print {
                run_step.log(
                    Severity::Info,
                    format!("{seconds_remaining} seconds remaining in test"),
                );
                next_print = next_occurrence(self.config.print_delay, 0, now_s);
            }

            if next_injection != 0 && now_s >= next_injection {
                // Relabel one page so the verifiers have something to find.
                run_step.log(Severity::Debug, "injecting a mislabeled page");
                if let Ok(mut lease) = self.pool.take_valid(None, run_step) {
                    if let Some(pattern) = self.patterns.pattern(0) {
                        lease.pattern = Some(Arc::clone(pattern));
                    }
                    let _ = self.pool.put_valid(lease);
                }
                next_injection = next_occurrence(INJECTION_FREQUENCY_S, 0, now_s);
            }

            if next_pause != 0 && now_s >= next_pause {
                run_step.log(
                    Severity::Info,
                    format!(
                        "pausing worker threads for a power spike with {seconds_remaining} \
                         seconds remaining"
                    ),
                );
                self.power_spike_status.pause_workers();
                next_pause = 0;
                next_resume = now_s + self.config.pause_duration;
            }

            if next_resume != 0 && now_s >= next_resume {
                run_step.log(
                    Severity::Info,
                    format!(
                        "resuming worker threads to cause a power spike with \
                         {seconds_remaining} seconds remaining"
                    ),
                );
                self.power_spike_status.resume_workers();
                next_pause = next_occurrence(self.config.pause_delay, 0, now_s);
                next_resume = 0;
            }

            let wake = next_occurrence(SLEEP_FREQUENCY_S, 0, now_s).min(end_s);
            std::thread::sleep(Duration::from_secs(wake.saturating_sub(now_s).max(1)));
            now_s = start.elapsed().as_secs();
        }

        // Never leave the pool paused on the way out.
        if next_resume != 0 {
            self.power_spike_status.resume_workers();
        }
    }

    /// Post-run verification: a set of check workers drains every valid
    /// page to empty, counting what they find.
    fn final_check(&mut self) -> u64 {
        let check_step = self.track_step(Step::new("Run Post-Test Memory Check Threads"));
        check_step.log(
            Severity::Debug,
            "finished countdown, checking results of every page",
        );

        let reap_status = Arc::new(WorkerStatus::new());
        let mut workers: Vec<(Box<dyn Worker>, WorkerContext)> = Vec::new();
        for _ in 0..self.config.fill_threads {
            let ctx = self.worker_context(
                WorkerKind::Check,
                Arc::clone(&reap_status),
                check_step.clone(),
            );
            workers.push((Box::new(CheckWorker), ctx));
        }

        reap_status.initialize();
        // Drain mode: the stop signal makes checked pages park empty.
        reap_status.stop_workers();

        let handles: Vec<WorkerHandle> = workers
            .into_iter()
            .map(|(worker, ctx)| spawn_worker(worker, ctx))
            .collect();

        let mut errors = 0u64;
        for handle in handles {
            let stats = Arc::clone(&handle.stats);
            let thread_num = handle.thread_num;
            if !handle.join() {
                check_step.add_error(
                    PROCESS_ERROR,
                    format!("post-test check thread {thread_num} failed"),
                );
            }
            let found = stats.errors.load(Ordering::Relaxed);
            check_step.log(
                Severity::Debug,
                format!("check thread {thread_num} found {found} hardware incidents"),
            );
            errors += found;
        }
        errors
    }

    fn totals(kind_stats: &[(WorkerKind, Arc<crate::workers::WorkerStats>)], page_len: usize) -> (f64, f64) {
        let mut total_data = 0.0;
        let mut max_runtime = 0.0f64;
        for (kind, stats) in kind_stats {
            total_data += stats.memory_data_mb(*kind, page_len);
            max_runtime = max_runtime.max(stats.run_seconds());
        }
        let bandwidth = if max_runtime > 0.0 { total_data / max_runtime } else { 0.0 };
        (total_data, bandwidth)
    }

    /// Bandwidth and data-volume measurements, overall and per kind.
    fn run_analysis(&mut self, kind_stats: &[(WorkerKind, Arc<crate::workers::WorkerStats>)]) {
        let analysis_step = self.track_step(Step::new("Run and Report Thread Analysis"));
        let page_len = self.config.page_size_bytes as usize;

        let (total_data, total_bandwidth) = Self::totals(kind_stats, page_len);
        analysis_step.add_measurement("Total Data Copied", "MB", total_data);
        analysis_step.add_measurement("Total Bandwidth", "MB/s", total_bandwidth);

        for (label, kind) in [
            ("Memory", WorkerKind::Copy),
            ("Check", WorkerKind::Check),
            ("Invert", WorkerKind::Invert),
        ] {
            let mut data = 0.0;
            let mut bandwidth = 0.0;
            let mut present = false;
            for (k, stats) in kind_stats.iter().filter(|(k, _)| *k == kind) {
                present = true;
                data += stats.memory_data_mb(*k, page_len);
                bandwidth += stats.memory_data_mb(*k, page_len) / stats.run_seconds();
            }
            if present {
                analysis_step.add_measurement(&format!("{label} Data Copied"), "MB", data);
                analysis_step.add_measurement(&format!("{label} Bandwidth"), "MB/s", bandwidth);
            }
        }
    }

    /// Pages in the test arena.
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// The pool, for inspection by integration tests and tooling.
    #[must_use]
    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Request a user break as the signal handler would.
    pub fn request_user_break() {
        USER_BREAK.store(true, Ordering::Relaxed);
    }
}
