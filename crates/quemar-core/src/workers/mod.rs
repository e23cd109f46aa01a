//! The worker pool: the task trait, spawn plumbing, and the verification
//! helpers every memory worker shares.
//!
//! Each worker kind is a struct with its own loop body; the helpers here
//! (`fill_page`, `crc_check_page`, `crc_copy_page`, `check_region`,
//! `process_error`, and the tag-mode variants) operate on borrowed page
//! leases so any loop can compose them.

pub mod cache_coherency;
pub mod check;
pub mod copy;
pub mod cpu_freq;
pub mod cpu_stress;
pub mod fill;
pub mod invert;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::sched::CpuSet;

use crate::checksum::{adler_memcpy, calculate_checksum, AdlerChecksum, CRC_BLOCK_SIZE, CRC_BLOCK_WORDS};
use crate::config::Config;
use crate::os::{self, OsLayer};
use crate::pattern::{Pattern, PatternList};
use crate::pool::{PageLease, PagePool};
use crate::status::WorkerStatus;
use crate::telemetry::{
    DiagnosisKind, Severity, Step, BLOCK_PATTERN_MISMATCH_FAIL, MEMORY_MISCOMPARE_FAIL,
    PROCESS_ERROR, TAG_MISCOMPARE_FAIL,
};

/// Queued miscompares per region before switching to full-page reporting.
const ERROR_RECORD_LIMIT: usize = 128;

/// The worker kinds the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Startup page filler.
    Fill,
    /// Memory copy worker.
    Copy,
    /// Memory invert worker.
    Invert,
    /// Memory check worker.
    Check,
    /// CPU stress worker.
    CpuStress,
    /// Cache-coherency probe.
    CacheCoherency,
    /// CPU-frequency probe.
    CpuFreq,
}

impl WorkerKind {
    /// Log prefix for this kind.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Fill => "Memory Page Fill Thread",
            Self::Copy => "Memory Copy Thread",
            Self::Invert => "Memory Page Invert Thread",
            Self::Check => "Memory Page Check Thread",
            Self::CpuStress => "CPU Stress Thread",
            Self::CacheCoherency => "CPU Cache Coherency Thread",
            Self::CpuFreq => "CPU Frequency Thread",
        }
    }

    /// Bytes of memory traffic per page processed, as a multiple of the
    /// page size (a copy reads and writes, an invert sweeps four times).
    #[must_use]
    pub fn memory_data_factor(self) -> f64 {
        match self {
            Self::Copy => 2.0,
            Self::Invert => 4.0,
            Self::Check => 1.0,
            Self::Fill | Self::CpuStress | Self::CacheCoherency | Self::CpuFreq => 0.0,
        }
    }
}

/// Per-worker counters, shared with the orchestrator.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Pages processed (loop units).
    pub pages_copied: AtomicU64,
    /// Miscompares seen by this worker.
    pub errors: AtomicU64,
    /// Loop iterations completed; used to observe pause semantics.
    pub iterations: AtomicU64,
    /// Accumulated run duration in microseconds.
    pub run_duration_us: AtomicU64,
    /// Software status: false when the worker hit a process error.
    pub ok: AtomicBool,
}

impl WorkerStats {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { ok: AtomicBool::new(true), ..Self::default() })
    }

    /// Megabytes of memory traffic this worker generated.
    #[must_use]
    pub fn memory_data_mb(&self, kind: WorkerKind, page_len: usize) -> f64 {
        self.pages_copied.load(Ordering::Relaxed) as f64 * page_len as f64
            * kind.memory_data_factor()
            / (1024.0 * 1024.0)
    }

    /// Run duration in seconds (at least one microsecond worth).
    #[must_use]
    pub fn run_seconds(&self) -> f64 {
        self.run_duration_us.load(Ordering::Relaxed).max(1) as f64 / 1_000_000.0
    }
}

/// Everything a worker needs from its environment, passed at spawn.
pub struct WorkerContext {
    /// Engine-wide worker index.
    pub thread_num: usize,
    /// What kind of worker owns this context.
    pub kind: WorkerKind,
    /// The page pool.
    pub pool: Arc<PagePool>,
    /// The pattern catalog.
    pub patterns: Arc<PatternList>,
    /// The OS layer.
    pub os: Arc<OsLayer>,
    /// The pause/stop controller this worker obeys.
    pub status: Arc<WorkerStatus>,
    /// Telemetry step to report into.
    pub step: Step,
    /// This worker's counters.
    pub stats: Arc<WorkerStats>,
    /// Bytes per page.
    pub page_len: usize,
    /// Verify checksums while copying.
    pub strict: bool,
    /// Use the SIMD warm copy.
    pub warm: bool,
    /// Address-tag mode.
    pub tag_mode: bool,
    /// Inject faults for self-test.
    pub error_injection: bool,
    /// Region tag filter for page takes; `None` takes any page.
    pub tag: Option<u32>,
    /// CPUs to bind to, when affinity is on.
    pub cpu_mask: Option<CpuSet>,
    /// Whether to pin at all.
    pub use_affinity: bool,
}

impl WorkerContext {
    /// Build a context from the engine's shared pieces.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        thread_num: usize,
        kind: WorkerKind,
        config: &Config,
        pool: Arc<PagePool>,
        patterns: Arc<PatternList>,
        os: Arc<OsLayer>,
        status: Arc<WorkerStatus>,
        step: Step,
    ) -> Self {
        status.add_workers(1);
        Self {
            thread_num,
            kind,
            pool,
            patterns,
            os,
            status,
            step,
            stats: WorkerStats::new(),
            page_len: config.page_size_bytes as usize,
            strict: config.strict,
            warm: config.warm,
            tag_mode: config.tag_mode,
            error_injection: config.error_injection,
            tag: None,
            cpu_mask: None,
            use_affinity: config.use_affinity,
        }
    }

    /// Log with the worker's type and number prefixed.
    pub fn log(&self, severity: Severity, message: impl AsRef<str>) {
        self.step.log(
            severity,
            format!("{} #{}: {}", self.kind.type_name(), self.thread_num, message.as_ref()),
        );
    }

    /// Record a software fault attributed to this worker.
    pub fn add_process_error(&self, message: impl AsRef<str>) {
        self.step.add_error(
            PROCESS_ERROR,
            format!("{} #{}: {}", self.kind.type_name(), self.thread_num, message.as_ref()),
        );
    }

    /// Record a hardware diagnosis attributed to this worker.
    pub fn add_diagnosis(&self, verdict: &str, kind: DiagnosisKind, message: impl AsRef<str>) {
        self.step.add_diagnosis(
            verdict,
            kind,
            format!("{} #{}: {}", self.kind.type_name(), self.thread_num, message.as_ref()),
        );
    }

    /// Poll the controller, blocking across pauses.
    pub fn should_continue(&self, paused: &mut bool) -> bool {
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);
        self.status.should_continue(paused)
    }

    /// Poll the controller without ever pausing.
    #[must_use]
    pub fn should_continue_no_pause(&self) -> bool {
        self.status.should_continue_no_pause()
    }
}

/// A long-running task in the pool.
pub trait Worker: Send {
    /// Which kind this is.
    fn kind(&self) -> WorkerKind;

    /// The task loop. Returns the worker's software status: false only on
    /// process errors, never on hardware miscompares.
    fn run(&mut self, ctx: &WorkerContext) -> bool;
}

/// A spawned worker's thread plus its shared counters.
pub struct WorkerHandle {
    /// Worker kind, for per-kind bandwidth accounting.
    pub kind: WorkerKind,
    /// Engine-wide worker index.
    pub thread_num: usize,
    /// The worker's counters.
    pub stats: Arc<WorkerStats>,
    join: std::thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait for the worker to exit; returns its software status.
    #[must_use]
    pub fn join(self) -> bool {
        let ok = self.join.join().is_ok();
        ok && self.stats.ok.load(Ordering::Relaxed)
    }
}

/// Launch a worker on its own OS thread.
///
/// The thread binds to the context's CPU mask, times itself, runs the task
/// loop, and deregisters from the controller on the way out.
pub fn spawn_worker(mut worker: Box<dyn Worker>, ctx: WorkerContext) -> WorkerHandle {
    let kind = ctx.kind;
    let thread_num = ctx.thread_num;
    let stats = Arc::clone(&ctx.stats);

    let join = std::thread::Builder::new()
        .name(format!("quemar-{thread_num}"))
        .spawn(move || {
            if ctx.use_affinity {
                if let Some(mask) = ctx.cpu_mask {
                    if os::bind_to_cpus(&mask).is_err() {
                        ctx.log(
                            Severity::Warning,
                            format!("bind to {} failed", os::cpuset_format(&mask)),
                        );
                    }
                }
            }
            ctx.log(
                Severity::Debug,
                format!("running on core {}", os::current_cpu()),
            );

            let start = Instant::now();
            let ok = worker.run(&ctx);
            ctx.stats
                .run_duration_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            ctx.stats.ok.store(ok, Ordering::Relaxed);
            ctx.status.remove_self();
        })
        .expect("thread spawn");

    WorkerHandle { kind, thread_num, stats, join }
}

/// Give up the CPU until rescheduled, so workers do not preempt each other
/// mid-sweep and thrash the caches.
pub(crate) fn yield_self() {
    std::thread::yield_now();
}

// ----------------------------------------------------------------------
// Shared verification helpers
// ----------------------------------------------------------------------

/// A captured miscompare, queued for later reporting.
#[derive(Debug, Clone)]
pub(crate) struct ErrorRecord {
    /// Value actually read.
    pub actual: u64,
    /// Value read again under a flush, filled in while processing.
    pub reread: u64,
    /// Value that should have been there.
    pub expected: u64,
    /// Address of the 64-bit word.
    pub vaddr: usize,
    /// Physical address of the first differing byte, resolved while
    /// processing.
    pub paddr: u64,
    /// In tag mode, the address the stale tag decodes to.
    pub tag_vaddr: usize,
    /// Probable last writer CPU.
    pub last_cpu: u32,
    /// Name of the expected pattern.
    pub pattern_name: String,
}

impl ErrorRecord {
    fn new(actual: u64, expected: u64, vaddr: usize, last_cpu: u32, pattern_name: &str) -> Self {
        Self {
            actual,
            reread: 0,
            expected,
            vaddr,
            paddr: 0,
            tag_vaddr: 0,
            last_cpu,
            pattern_name: pattern_name.to_string(),
        }
    }
}

#[inline]
fn pattern_word64(pattern: &Pattern, word_index: usize, pattern_offset: usize) -> u64 {
    let index = (2 * word_index + pattern_offset) as u32;
    u64::from(pattern.word(index)) | (u64::from(pattern.word(index + 1)) << 32)
}

#[inline]
fn addr_to_tag(addr: *const u64) -> u64 {
    addr as u64
}

/// Whether `addr` is the first word of a cacheline (the tagged position).
#[inline]
fn is_tag_word(addr: *const u64) -> bool {
    addr as usize & 0x3f == 0
}

/// Fill a leased page from its assigned pattern (tagging cachelines in tag
/// mode). Returns false when the lease carries no pattern.
pub(crate) fn fill_page(ctx: &WorkerContext, lease: &mut PageLease<'_>) -> bool {
    let Some(pattern) = lease.pattern.clone() else {
        ctx.log(Severity::Error, "attempted to fill a page with no pattern assigned");
        return false;
    };
    lease.last_cpu = os::current_cpu();

    let words = lease.words_mut(ctx.page_len);
    if ctx.tag_mode {
        for i in 0..words.len() {
            words[i] = if i % 8 == 0 {
                addr_to_tag(std::ptr::addr_of!(words[i]))
            } else {
                pattern_word64(&pattern, i, 0)
            };
        }
    } else {
        for (i, word) in words.iter_mut().enumerate() {
            *word = pattern_word64(&pattern, i, 0);
        }
    }
    true
}

/// Re-read a suspect word under a flush, localize the first differing
/// byte, resolve it to a DIMM, report, and repair.
pub(crate) fn process_error(ctx: &WorkerContext, record: &mut ErrorRecord, message: &str) {
    let core = os::current_cpu();

    ctx.os.flush(record.vaddr);
    // SAFETY: the record's address lies in a page this worker holds.
    record.reread = unsafe { std::ptr::read_volatile(record.vaddr as *const u64) };

    let good = record.expected.to_ne_bytes();
    let bad = record.actual.to_ne_bytes();
    let mut byte = 0;
    while byte < 7 && good[byte] == bad[byte] {
        byte += 1;
    }

    record.paddr = ctx.os.virtual_to_physical(record.vaddr + byte);
    let dimm = ctx.os.find_dimm(record.paddr);

    let error_kind = if record.reread == record.expected { "read error" } else { "write error" };
    ctx.add_diagnosis(
        MEMORY_MISCOMPARE_FAIL,
        DiagnosisKind::Fail,
        format!(
            "{message}: miscompare on CPU {core}(<-{lastcpu}) at {vaddr:#x}({paddr:#x}:{dimm}): \
             read:{actual:#018x}, reread:{reread:#018x} expected:{expected:#018x}. \
             '{pattern}' {error_kind}",
            lastcpu = record.last_cpu,
            vaddr = record.vaddr,
            paddr = record.paddr,
            actual = record.actual,
            reread = record.reread,
            expected = record.expected,
            pattern = record.pattern_name,
        ),
    );

    // Overwrite the bad cell so repeated verification does not fire on the
    // same fault again.
    // SAFETY: as above; this worker owns the page.
    unsafe {
        std::ptr::write_volatile(record.vaddr as *mut u64, record.expected);
    }
    ctx.os.flush(record.vaddr);
}

/// Scan the alternate-pattern automaton over the region: detects one
/// contiguous run of `alt` inside data expected to be `pattern`.
/// Returns `Some((first_word, last_word))` on a match.
fn scan_alternate_pattern(
    mem: &[u64],
    pattern: &Pattern,
    alt: &Pattern,
    pattern_offset: usize,
) -> Option<(usize, usize)> {
    #[derive(PartialEq)]
    enum State {
        Good,
        Bad,
        GoodAgain,
    }

    let mut state = State::Good;
    let mut bad_start = 0;
    let mut bad_end = 0;

    for (i, &actual) in mem.iter().enumerate() {
        let expected = pattern_word64(pattern, i, pattern_offset);
        let possible = pattern_word64(alt, i, pattern_offset);

        state = match state {
            State::Good => {
                if actual == expected {
                    State::Good
                } else if actual == possible {
                    bad_start = i;
                    bad_end = i;
                    State::Bad
                } else {
                    return None;
                }
            }
            State::Bad => {
                if actual == possible {
                    bad_end = i;
                    State::Bad
                } else if actual == expected {
                    State::GoodAgain
                } else {
                    return None;
                }
            }
            State::GoodAgain => {
                if actual == expected {
                    State::GoodAgain
                } else {
                    return None;
                }
            }
        };
    }

    match state {
        State::Bad | State::GoodAgain => Some((bad_start, bad_end)),
        State::Good => None,
    }
}

/// Word-by-word comparison of a suspect region against its pattern.
///
/// Queues up to [`ERROR_RECORD_LIMIT`] records; on overflow switches into
/// full-page mode and reports every mismatch found. Runs the whole-block
/// re-pattern analysis before processing the queue. Returns the number of
/// miscompares found (block-level findings are diagnosed once and not
/// multiply counted).
pub(crate) fn check_region(
    ctx: &WorkerContext,
    mem: &mut [u64],
    pattern: &Pattern,
    last_cpu: u32,
    region_byte_offset: usize,
    pattern_offset: usize,
) -> u64 {
    let mut recorded: Vec<ErrorRecord> = Vec::with_capacity(ERROR_RECORD_LIMIT);
    let mut page_error = false;
    let mut message = "Hardware Error";

    let expected_at = |mem: &[u64], i: usize| {
        let addr = std::ptr::addr_of!(mem[i]);
        if ctx.tag_mode && is_tag_word(addr) {
            addr_to_tag(addr)
        } else {
            pattern_word64(pattern, i, pattern_offset)
        }
    };

    for i in 0..mem.len() {
        let actual = mem[i];
        let expected = expected_at(mem, i);
        if actual != expected {
            if recorded.len() < ERROR_RECORD_LIMIT {
                recorded.push(ErrorRecord::new(
                    actual,
                    expected,
                    std::ptr::addr_of_mut!(mem[i]) as usize,
                    last_cpu,
                    pattern.name(),
                ));
            } else {
                ctx.log(Severity::Debug, "error record overflow, too many miscompares");
                message = "Page Error";
                page_error = true;
                break;
            }
        }
    }

    // A page's worth of damage often means the data is simply a different
    // catalog pattern: a misdirected write rather than bad cells.
    if page_error && !ctx.tag_mode {
        for alt in ctx.patterns.iter() {
            if alt.name() == pattern.name() {
                continue;
            }
            if let Some((first, last)) = scan_alternate_pattern(mem, pattern, alt, pattern_offset) {
                message = "Block Error";
                let run_bytes = (last - first + 1) * 8;
                // The first record doubles as the block's representative
                // miscompare; it may be corrected twice and simply reports
                // twice.
                if let Some(first_record) = recorded.first() {
                    let mut representative = first_record.clone();
                    process_error(ctx, &mut representative, message);
                }
                ctx.add_diagnosis(
                    BLOCK_PATTERN_MISMATCH_FAIL,
                    DiagnosisKind::Fail,
                    format!(
                        "block error at {:#x}: pattern {} instead of {}, {} bytes from \
                         offset {:#x} to {:#x}",
                        std::ptr::addr_of!(mem[first]) as usize,
                        alt.name(),
                        pattern.name(),
                        run_bytes,
                        region_byte_offset + first * 8,
                        region_byte_offset + (last + 1) * 8 - 1,
                    ),
                );
            }
        }
    }

    for record in &mut recorded {
        process_error(ctx, record, message);
    }

    let mut overflow_errors = 0u64;
    if page_error {
        // Full-page mode: everything the bounded queue missed. Cells
        // already processed above were repaired and will not re-fire.
        for i in 0..mem.len() {
            let actual = mem[i];
            let expected = expected_at(mem, i);
            if actual != expected {
                let mut record = ErrorRecord::new(
                    actual,
                    expected,
                    std::ptr::addr_of_mut!(mem[i]) as usize,
                    last_cpu,
                    pattern.name(),
                );
                process_error(ctx, &mut record, message);
                overflow_errors += 1;
            }
        }
    }

    let total = recorded.len() as u64 + overflow_errors;
    ctx.stats.errors.fetch_add(total, Ordering::Relaxed);
    total
}

/// CRC-check every 4 KiB block of a leased page against the precomputed
/// pattern checksum, falling through to [`check_region`] on mismatch.
/// Returns the miscompare count.
pub(crate) fn crc_check_page(ctx: &WorkerContext, lease: &mut PageLease<'_>) -> u64 {
    let Some(pattern) = lease.pattern.clone() else {
        ctx.add_process_error("crc check on a page with no pattern");
        return 0;
    };
    let expected_crc = *pattern.crc();
    let last_cpu = lease.last_cpu;

    // SAFETY: the lease maps the page and holds it exclusively.
    let words = unsafe { lease.words_unchecked(ctx.page_len) };
    let blocks = ctx.page_len / CRC_BLOCK_SIZE;
    let mut errors = 0u64;

    for block in 0..blocks {
        let slice = &mut words[block * CRC_BLOCK_WORDS..(block + 1) * CRC_BLOCK_WORDS];
        let mut crc = AdlerChecksum::default();
        let crc_ok = if ctx.tag_mode {
            adler_addr_crc(ctx, slice, &pattern, &mut crc)
        } else {
            calculate_checksum(slice, &mut crc).is_ok()
        };
        if !crc_ok {
            ctx.add_process_error("checksum calculation rejected a block");
            continue;
        }

        if crc != expected_crc {
            ctx.log(
                Severity::Debug,
                format!(
                    "crc check falling through to slow compare, mismatch {crc} != {expected_crc}"
                ),
            );
            let found = check_region(
                ctx,
                slice,
                &pattern,
                last_cpu,
                block * CRC_BLOCK_SIZE,
                0,
            );
            if found == 0 {
                ctx.log(
                    Severity::Warning,
                    format!(
                        "crc mismatch {crc} != {expected_crc}, but no miscompares found"
                    ),
                );
            }
            errors += found;
        }
    }

    // Pages smaller than a CRC block verify word-by-word.
    let leftover_words = (ctx.page_len % CRC_BLOCK_SIZE) / 8;
    if leftover_words > 0 {
        let start = blocks * CRC_BLOCK_WORDS;
        let slice = &mut words[start..start + leftover_words];
        errors += check_region(ctx, slice, &pattern, last_cpu, blocks * CRC_BLOCK_SIZE, 0);
    }

    errors
}

/// Checksum-mismatch fallout shared by both copy flavors: slow-compare the
/// source, retry against the data the copy originally read, and report a
/// sentinel miscompare when the corruption refuses to localize.
#[allow(clippy::too_many_arguments)]
fn investigate_copy_mismatch(
    ctx: &WorkerContext,
    source: &mut [u64],
    target: &[u64],
    pattern: &Pattern,
    last_cpu: u32,
    block_byte_offset: usize,
    crc: &AdlerChecksum,
    expected_crc: &AdlerChecksum,
    label: &str,
) -> u64 {
    ctx.log(
        Severity::Debug,
        format!("{label} falling through to slow compare, crc mismatch {crc} != {expected_crc}"),
    );
    let mut errors = check_region(ctx, source, pattern, last_cpu, block_byte_offset, 0);
    if errors > 0 {
        return errors;
    }

    ctx.log(
        Severity::Warning,
        format!(
            "{label} crc mismatch {crc} != {expected_crc}, but no miscompares found. \
             Retrying with fresh data."
        ),
    );
    if ctx.tag_mode {
        return 0;
    }

    // Re-seat the data the copy originally read; if the corruption was in
    // the read path it is preserved in the target.
    source.copy_from_slice(target);
    errors = check_region(ctx, source, pattern, last_cpu, block_byte_offset, 0);
    if errors == 0 {
        let core = os::current_cpu();
        ctx.log(
            Severity::Error,
            format!(
                "CPU {core} {label} crc mismatch {crc} != {expected_crc}, but no miscompares \
                 found on second pass"
            ),
        );
        let mut record = ErrorRecord::new(
            source[0],
            0xbad0_0000u64 << 32,
            source.as_mut_ptr() as usize,
            last_cpu,
            pattern.name(),
        );
        process_error(ctx, &mut record, "Hardware Error");
        ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
        errors = 1;
    }
    errors
}

/// Copy a page block-by-block while keeping a CRC of the data in flight,
/// slow-comparing any block whose checksum disagrees with the pattern.
/// Returns the miscompare count.
pub(crate) fn crc_copy_page(
    ctx: &WorkerContext,
    dst: &mut PageLease<'_>,
    src: &mut PageLease<'_>,
) -> u64 {
    let Some(pattern) = src.pattern.clone() else {
        ctx.add_process_error("crc copy from a page with no pattern");
        return 0;
    };
    let expected_crc = *pattern.crc();
    let last_cpu = src.last_cpu;

    // SAFETY: both leases map distinct pages held exclusively by this
    // worker.
    let src_words = unsafe { src.words_unchecked(ctx.page_len) };
    let dst_words = unsafe { dst.words_unchecked(ctx.page_len) };

    let blocks = ctx.page_len / CRC_BLOCK_SIZE;
    let mut errors = 0u64;

    for block in 0..blocks {
        let range = block * CRC_BLOCK_WORDS..(block + 1) * CRC_BLOCK_WORDS;
        let source = &mut src_words[range.clone()];
        let target = &mut dst_words[range];

        let mut crc = AdlerChecksum::default();
        let copied = if ctx.tag_mode {
            adler_addr_memcpy(ctx, target, source, &pattern, &mut crc)
        } else {
            adler_memcpy(target, source, &mut crc).is_ok()
        };
        if !copied {
            ctx.add_process_error("copy checksum rejected a block");
            continue;
        }

        if crc != expected_crc {
            errors += investigate_copy_mismatch(
                ctx,
                source,
                target,
                &pattern,
                last_cpu,
                block * CRC_BLOCK_SIZE,
                &crc,
                &expected_crc,
                "CrcCopyPage",
            );
        }
    }

    copy_leftovers(ctx, dst_words, src_words, &pattern, last_cpu, blocks, &mut errors);
    finish_copy(ctx, dst, src, errors);
    errors
}

/// Copy a page with the SIMD warm path: nontemporal stores plus explicit
/// cacheline flushes, then the same verification as [`crc_copy_page`].
pub(crate) fn crc_warm_copy_page(
    ctx: &WorkerContext,
    dst: &mut PageLease<'_>,
    src: &mut PageLease<'_>,
) -> u64 {
    let Some(pattern) = src.pattern.clone() else {
        ctx.add_process_error("crc warm copy from a page with no pattern");
        return 0;
    };
    let expected_crc = *pattern.crc();
    let last_cpu = src.last_cpu;

    // SAFETY: both leases map distinct pages held exclusively by this
    // worker.
    let src_words = unsafe { src.words_unchecked(ctx.page_len) };
    let dst_words = unsafe { dst.words_unchecked(ctx.page_len) };

    let blocks = ctx.page_len / CRC_BLOCK_SIZE;
    let mut errors = 0u64;

    for block in 0..blocks {
        let range = block * CRC_BLOCK_WORDS..(block + 1) * CRC_BLOCK_WORDS;
        let source = &mut src_words[range.clone()];
        let target = &mut dst_words[range];

        let mut crc = AdlerChecksum::default();
        let copied = if ctx.tag_mode {
            adler_addr_memcpy_warm(ctx, target, source, &pattern, &mut crc)
        } else {
            ctx.os.adler_memcpy_warm(target, source, &mut crc).is_ok()
        };
        if !copied {
            ctx.add_process_error("warm copy checksum rejected a block");
            continue;
        }

        if crc != expected_crc {
            errors += investigate_copy_mismatch(
                ctx,
                source,
                target,
                &pattern,
                last_cpu,
                block * CRC_BLOCK_SIZE,
                &crc,
                &expected_crc,
                "CrcWarmCopyPage",
            );
        }
    }

    copy_leftovers(ctx, dst_words, src_words, &pattern, last_cpu, blocks, &mut errors);
    finish_copy(ctx, dst, src, errors);
    errors
}

/// Verify and copy the sub-block tail of short pages.
fn copy_leftovers(
    ctx: &WorkerContext,
    dst_words: &mut [u64],
    src_words: &mut [u64],
    pattern: &Pattern,
    last_cpu: u32,
    blocks: usize,
    errors: &mut u64,
) {
    let leftover_words = (ctx.page_len % CRC_BLOCK_SIZE) / 8;
    if leftover_words == 0 {
        return;
    }
    let start = blocks * CRC_BLOCK_WORDS;
    let source = &mut src_words[start..start + leftover_words];
    *errors += check_region(ctx, source, pattern, last_cpu, blocks * CRC_BLOCK_SIZE, 0);
    dst_words[start..start + leftover_words].copy_from_slice(source);
}

/// Stamp the destination's provenance; refill it when errors were seen so
/// bad data does not propagate across the pool.
fn finish_copy(ctx: &WorkerContext, dst: &mut PageLease<'_>, src: &PageLease<'_>, errors: u64) {
    dst.pattern = src.pattern.clone();
    dst.last_cpu = os::current_cpu();
    if errors > 0 {
        fill_page(ctx, dst);
    }
}

// ----------------------------------------------------------------------
// Address-tag mode
// ----------------------------------------------------------------------

/// Write the address tag into the first word of every cacheline.
pub(crate) fn tag_addr(words: &mut [u64]) {
    for i in (0..words.len()).step_by(8) {
        words[i] = addr_to_tag(std::ptr::addr_of!(words[i]));
    }
}

/// Report a cacheline tag that did not equal its own address.
///
/// The stale tag value decodes to the virtual address the data was written
/// for, which cross-correlates the failing DIMM pair.
pub(crate) fn report_tag_error(ctx: &WorkerContext, vaddr: *const u64, actual: u64, tag: u64) {
    let mut record = ErrorRecord::new(actual, tag, vaddr as usize, 0, "addressTag");
    record.tag_vaddr = actual as usize;
    process_tag_error(ctx, &mut record, "Hardware Error");
}

fn process_tag_error(ctx: &WorkerContext, record: &mut ErrorRecord, message: &str) {
    let core = os::current_cpu();

    ctx.os.flush(record.vaddr);
    // SAFETY: the tag word lies in a page this worker holds.
    record.reread = unsafe { std::ptr::read_volatile(record.vaddr as *const u64) };
    let error_kind = if record.actual == record.reread { "write error" } else { "read error" };

    record.paddr = ctx.os.virtual_to_physical(record.vaddr);
    let tag_paddr = ctx.os.virtual_to_physical(record.tag_vaddr);
    let dimm = ctx.os.find_dimm(record.paddr);
    let tag_dimm = ctx.os.find_dimm(tag_paddr);

    ctx.add_diagnosis(
        TAG_MISCOMPARE_FAIL,
        DiagnosisKind::Fail,
        format!(
            "{message}: tag from {tag_vaddr:#x}({tag_paddr:#x}:{tag_dimm}) ({error_kind}) \
             miscompare on CPU {core} at {vaddr:#x}({paddr:#x}:{dimm}): \
             read:{actual:#018x}, reread:{reread:#018x} expected:{expected:#018x}",
            tag_vaddr = record.tag_vaddr,
            vaddr = record.vaddr,
            paddr = record.paddr,
            actual = record.actual,
            reread = record.reread,
            expected = record.expected,
        ),
    );
    ctx.stats.errors.fetch_add(1, Ordering::Relaxed);

    // SAFETY: as above.
    unsafe {
        std::ptr::write_volatile(record.vaddr as *mut u64, record.expected);
    }
    ctx.os.flush(record.vaddr);
}

/// Checksum a block in tag mode: tag words are verified against their own
/// address and contribute their pattern value to the checksum, so the
/// result still compares against the pattern's precomputed CRC.
pub(crate) fn adler_addr_crc(
    ctx: &WorkerContext,
    mem: &[u64],
    pattern: &Pattern,
    checksum_out: &mut AdlerChecksum,
) -> bool {
    if mem.len() >= (1 << 19) || mem.len() % 2 != 0 {
        return false;
    }

    let mut a1: u64 = 1;
    let mut a2: u64 = 1;
    let mut b1: u64 = 0;
    let mut b2: u64 = 0;

    let mut lane1 = |value: u64| {
        a1 = a1.wrapping_add(value & 0xffff_ffff);
        b1 = b1.wrapping_add(a1);
        a1 = a1.wrapping_add(value >> 32);
        b1 = b1.wrapping_add(a1);
    };

    let mut i = 0;
    while i < mem.len() {
        let addr = std::ptr::addr_of!(mem[i]);
        let data = mem[i];
        if is_tag_word(addr) {
            let tag = addr_to_tag(addr);
            if data != tag {
                report_tag_error(ctx, addr, data, tag);
            }
            lane1(pattern_word64(pattern, i, 0));
        } else {
            lane1(data);
        }
        i += 1;

        let data = mem[i];
        a2 = a2.wrapping_add(data & 0xffff_ffff);
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(data >> 32);
        b2 = b2.wrapping_add(a2);
        i += 1;
    }

    checksum_out.set(a1, a2, b1, b2);
    true
}

/// Copy a block in tag mode: verify the source and destination tags,
/// re-tag the destination, and checksum as [`adler_addr_crc`] does.
pub(crate) fn adler_addr_memcpy(
    ctx: &WorkerContext,
    dst: &mut [u64],
    src: &[u64],
    pattern: &Pattern,
    checksum_out: &mut AdlerChecksum,
) -> bool {
    if dst.len() != src.len() || src.len() >= (1 << 19) || src.len() % 2 != 0 {
        return false;
    }

    let mut a1: u64 = 1;
    let mut a2: u64 = 1;
    let mut b1: u64 = 0;
    let mut b2: u64 = 0;

    let mut i = 0;
    while i < src.len() {
        let src_addr = std::ptr::addr_of!(src[i]);
        let data = src[i];
        if is_tag_word(src_addr) {
            let dst_addr = std::ptr::addr_of!(dst[i]);
            let src_tag = addr_to_tag(src_addr);
            let dst_tag = addr_to_tag(dst_addr);
            if data != src_tag {
                report_tag_error(ctx, src_addr, data, src_tag);
            }
            let dst_data = dst[i];
            if dst_data != dst_tag {
                report_tag_error(ctx, dst_addr, dst_data, dst_tag);
            }

            let value = pattern_word64(pattern, i, 0);
            a1 = a1.wrapping_add(value & 0xffff_ffff);
            b1 = b1.wrapping_add(a1);
            a1 = a1.wrapping_add(value >> 32);
            b1 = b1.wrapping_add(a1);

            dst[i] = dst_tag;
        } else {
            a1 = a1.wrapping_add(data & 0xffff_ffff);
            b1 = b1.wrapping_add(a1);
            a1 = a1.wrapping_add(data >> 32);
            b1 = b1.wrapping_add(a1);
            dst[i] = data;
        }
        i += 1;

        let data = src[i];
        a2 = a2.wrapping_add(data & 0xffff_ffff);
        b2 = b2.wrapping_add(a2);
        a2 = a2.wrapping_add(data >> 32);
        b2 = b2.wrapping_add(a2);
        dst[i] = data;
        i += 1;
    }

    checksum_out.set(a1, a2, b1, b2);
    true
}

/// The warm flavor of [`adler_addr_memcpy`]: vector copy first (useful for
/// failures that only occur under nontemporal writes), flush both pages,
/// then verify the source tags and patch up the destination tags.
pub(crate) fn adler_addr_memcpy_warm(
    ctx: &WorkerContext,
    dst: &mut [u64],
    src: &mut [u64],
    pattern: &Pattern,
    checksum_out: &mut AdlerChecksum,
) -> bool {
    let mut ignored = AdlerChecksum::default();
    if ctx.os.adler_memcpy_warm(dst, src, &mut ignored).is_err() {
        return false;
    }

    let line_words = crate::simd::CACHE_LINE_SIZE / 8;
    crate::simd::fast_flush_sync();
    for i in (0..dst.len()).step_by(line_words) {
        crate::simd::fast_flush_hint(std::ptr::addr_of!(dst[i]).cast());
        crate::simd::fast_flush_hint(std::ptr::addr_of!(src[i]).cast());
    }
    crate::simd::fast_flush_sync();

    if !adler_addr_crc(ctx, src, pattern, checksum_out) {
        return false;
    }
    tag_addr(dst);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::TestMem;
    use crate::telemetry::Step;

    pub(crate) fn test_context(pages: u64, page_len: u64, tag_mode: bool) -> WorkerContext {
        let step = Step::new("worker test");
        let mem = Arc::new(TestMem::allocate((pages * page_len) as usize, 0, &step).unwrap());
        let pool = Arc::new(PagePool::fine(pages, page_len, mem));
        for i in 0..pages {
            pool.seed(i as usize, crate::page::PageEntry::new(i * page_len)).unwrap();
        }
        let os = Arc::new(OsLayer::new(None, &step).unwrap());
        let status = Arc::new(WorkerStatus::new());
        let config = Config {
            page_size_bytes: page_len,
            tag_mode,
            ..Config::default()
        };
        let patterns = Arc::new(PatternList::new().unwrap());
        WorkerContext::new(0, WorkerKind::Check, &config, pool, patterns, os, status, step)
    }

    #[test]
    fn test_fill_then_crc_check_is_clean() {
        let ctx = test_context(2, 1 << 16, false);
        let mut lease = ctx.pool.take_empty(None, &ctx.step).unwrap();
        lease.pattern = Some(ctx.patterns.random_pattern());
        assert!(fill_page(&ctx, &mut lease));
        assert_eq!(crc_check_page(&ctx, &mut lease), 0);
        assert_eq!(ctx.step.fail_count(), 0);
    }

    #[test]
    fn test_corrupted_byte_is_found_and_repaired() {
        let ctx = test_context(2, 1 << 16, false);
        let mut lease = ctx.pool.take_empty(None, &ctx.step).unwrap();
        lease.pattern = Some(ctx.patterns.random_pattern());
        fill_page(&ctx, &mut lease);

        // Flip one byte at offset 42.
        let addr = lease.vaddr + 42;
        // SAFETY: within the mapped page we hold.
        unsafe {
            std::ptr::write_volatile(addr as *mut u8, !std::ptr::read_volatile(addr as *const u8));
        }

        let errors = crc_check_page(&ctx, &mut lease);
        assert_eq!(errors, 1);
        assert_eq!(ctx.step.fail_count(), 1);
        let diag = &ctx.step.diagnoses()[0];
        assert_eq!(diag.verdict, MEMORY_MISCOMPARE_FAIL);
        assert!(diag.message.contains("write error"));

        // Repair happened: a second check is clean.
        assert_eq!(crc_check_page(&ctx, &mut lease), 0);
    }

    #[test]
    fn test_read_error_classification() {
        // A record whose actual value disagrees with the (good) memory is
        // reported as a read error: the reread under flush returns the
        // expected value.
        let ctx = test_context(2, 4096, false);
        let mut lease = ctx.pool.take_empty(None, &ctx.step).unwrap();
        lease.pattern = Some(ctx.patterns.random_pattern());
        fill_page(&ctx, &mut lease);

        let expected = lease.words_mut(4096)[0];
        let vaddr = lease.vaddr;
        let mut record = ErrorRecord::new(expected ^ 0xff, expected, vaddr, 0, "test");
        process_error(&ctx, &mut record, "Hardware Error");

        assert_eq!(record.reread, expected);
        assert!(ctx.step.diagnoses()[0].message.contains("read error"));
    }

    #[test]
    fn test_whole_block_repattern_analysis() {
        let ctx = test_context(2, 4096, false);
        let p1 = Arc::clone(ctx.patterns.iter().find(|p| p.name() == "walkingOnes").unwrap());
        let p2 = Arc::clone(ctx.patterns.iter().find(|p| p.name() == "justFive").unwrap());

        let mut lease = ctx.pool.take_empty(None, &ctx.step).unwrap();
        lease.pattern = Some(Arc::clone(&p1));
        fill_page(&ctx, &mut lease);

        // Overwrite the entire block with the alternate pattern.
        let words = lease.words_mut(4096);
        for (i, word) in words.iter_mut().enumerate() {
            *word = pattern_word64(&p2, i, 0);
        }

        crc_check_page(&ctx, &mut lease);

        let blocks: Vec<_> = ctx
            .step
            .diagnoses()
            .into_iter()
            .filter(|d| d.verdict == BLOCK_PATTERN_MISMATCH_FAIL)
            .collect();
        assert_eq!(blocks.len(), 1, "exactly one block diagnosis");
        assert!(blocks[0].message.contains(p2.name()));
        assert!(blocks[0].message.contains("offset 0x0 to 0xfff"));
    }

    #[test]
    fn test_crc_copy_page_clean_roundtrip() {
        let ctx = test_context(4, 1 << 16, false);
        let mut src = ctx.pool.take_empty(None, &ctx.step).unwrap();
        src.pattern = Some(ctx.patterns.random_pattern());
        fill_page(&ctx, &mut src);

        let mut dst = ctx.pool.take_empty(None, &ctx.step).unwrap();
        assert_eq!(crc_copy_page(&ctx, &mut dst, &mut src), 0);
        assert!(dst.pattern.is_some());
        assert_eq!(crc_check_page(&ctx, &mut dst), 0);
        assert_eq!(ctx.step.fail_count(), 0);
    }

    #[test]
    fn test_crc_warm_copy_page_clean_roundtrip() {
        let ctx = test_context(4, 1 << 16, false);
        let mut src = ctx.pool.take_empty(None, &ctx.step).unwrap();
        src.pattern = Some(ctx.patterns.random_pattern());
        fill_page(&ctx, &mut src);

        let mut dst = ctx.pool.take_empty(None, &ctx.step).unwrap();
        assert_eq!(crc_warm_copy_page(&ctx, &mut dst, &mut src), 0);
        assert_eq!(crc_check_page(&ctx, &mut dst), 0);
    }

    #[test]
    fn test_tag_mode_fill_copy_check_clean() {
        let ctx = test_context(4, 1 << 16, true);
        let mut src = ctx.pool.take_empty(None, &ctx.step).unwrap();
        src.pattern = Some(ctx.patterns.random_pattern());
        fill_page(&ctx, &mut src);
        assert_eq!(crc_check_page(&ctx, &mut src), 0);

        let mut dst = ctx.pool.take_empty(None, &ctx.step).unwrap();
        dst.pattern = src.pattern.clone();
        fill_page(&ctx, &mut dst);

        assert_eq!(crc_copy_page(&ctx, &mut dst, &mut src), 0);
        assert_eq!(crc_check_page(&ctx, &mut dst), 0);
        assert_eq!(ctx.step.fail_count(), 0, "no tag failures on clean memory");
    }

    #[test]
    fn test_tag_mismatch_is_reported_distinctly() {
        let ctx = test_context(2, 1 << 16, true);
        let mut lease = ctx.pool.take_empty(None, &ctx.step).unwrap();
        lease.pattern = Some(ctx.patterns.random_pattern());
        fill_page(&ctx, &mut lease);

        // Clobber the first tag word with some other page's address.
        let words = lease.words_mut(1 << 16);
        words[0] = 0xdead_beef_0000;

        crc_check_page(&ctx, &mut lease);
        let tags: Vec<_> = ctx
            .step
            .diagnoses()
            .into_iter()
            .filter(|d| d.verdict == TAG_MISCOMPARE_FAIL)
            .collect();
        assert!(!tags.is_empty());
        assert!(tags[0].message.contains("0xdeadbeef0000"));
    }

    #[test]
    fn test_worker_stats_bandwidth_accounting() {
        let stats = WorkerStats::new();
        stats.pages_copied.store(4, Ordering::Relaxed);
        let mb = stats.memory_data_mb(WorkerKind::Copy, 1 << 20);
        assert!((mb - 8.0).abs() < f64::EPSILON);
        let mb = stats.memory_data_mb(WorkerKind::Invert, 1 << 20);
        assert!((mb - 16.0).abs() < f64::EPSILON);
    }
}
