//! Cache-coherency probe: per-core counters racing across shared
//! cachelines.
//!
//! Each record spans whole cachelines and holds one byte-wide counter per
//! CPU. Every probe worker is pinned to its own core and increments only
//! its own byte, so on coherent hardware no increment can be lost; a local
//! sum that disagrees with the increment count means the coherency
//! protocol dropped a line update. Odd threads reverse their byte offset
//! on odd lines so physically distant cores contend for the same lines.

use std::alloc::Layout;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::telemetry::{DiagnosisKind, Severity, CACHE_COHERENCY_FAIL};
use crate::workers::{Worker, WorkerContext, WorkerKind};
use crate::{Error, Result};

// x^64 + x^63 + x^61 + x^60 + 1: a Galois LFSR feedback with period
// 2^64 - 1, cheap enough to stay in registers inside the probe loop.
const RANDOM_POLYNOMIAL: u64 = 0xD800_0000_0000_0000;

#[inline]
fn simple_random(seed: u64) -> u64 {
    (seed >> 1) ^ ((seed & 1).wrapping_neg() & RANDOM_POLYNOMIAL)
}

/// The shared counter arena: `record_count` records, each padded to whole
/// cachelines, each holding one byte counter per CPU.
pub struct CcArena {
    buf: *mut u8,
    layout: Layout,
    record_stride: usize,
    record_count: usize,
    num_cpus: usize,
}

// SAFETY: every byte of the arena is owned by exactly one (record, cpu)
// pair, and each probe worker only ever touches its own offsets.
unsafe impl Send for CcArena {}
unsafe impl Sync for CcArena {}

impl CcArena {
    /// Allocate a zeroed arena for `record_count` records, `num_cpus`
    /// counters each, padded to `line_size` boundaries.
    ///
    /// # Errors
    ///
    /// Fails when the layout is unrepresentable or allocation fails.
    pub fn new(record_count: usize, line_size: usize, num_cpus: usize) -> Result<Self> {
        let lines_per_record = num_cpus.div_ceil(line_size);
        let record_stride = lines_per_record * line_size;
        let layout = Layout::from_size_align(record_count * record_stride, line_size)
            .map_err(|e| Error::Allocation(format!("cache line arena layout: {e}")))?;

        // SAFETY: layout is non-zero (record_count and line_size are
        // validated by the config).
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        if buf.is_null() {
            return Err(Error::Allocation("cache line arena allocation failed".to_string()));
        }
        Ok(Self { buf, layout, record_stride, record_count, num_cpus })
    }

    /// Number of records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Counters per record.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    #[inline]
    fn counter(&self, record: usize, offset: usize) -> *mut u8 {
        debug_assert!(record < self.record_count && offset < self.num_cpus);
        // SAFETY: bounds asserted above; stride covers num_cpus bytes.
        unsafe { self.buf.add(record * self.record_stride + offset) }
    }

    /// Plain (deliberately non-atomic at the bus level) read-modify-write
    /// increment of one counter. Lost updates are exactly what the probe
    /// is hunting.
    #[inline]
    pub fn increment(&self, record: usize, offset: usize) {
        let ptr = self.counter(record, offset);
        // SAFETY: this (record, offset) byte belongs to the calling
        // thread alone.
        unsafe {
            std::ptr::write_volatile(ptr, std::ptr::read_volatile(ptr).wrapping_add(1));
        }
    }

    /// Read one counter and reset it for the next round.
    #[inline]
    pub fn take_and_zero(&self, record: usize, offset: usize) -> u8 {
        let ptr = self.counter(record, offset);
        // SAFETY: as in `increment`.
        unsafe {
            let value = std::ptr::read_volatile(ptr);
            std::ptr::write_volatile(ptr, 0);
            value
        }
    }
}

impl Drop for CcArena {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `new`.
        unsafe {
            std::alloc::dealloc(self.buf, self.layout);
        }
    }
}

/// One per-core probe worker.
pub struct CacheCoherencyWorker {
    arena: Arc<CcArena>,
    thread_id: usize,
    thread_count: usize,
    inc_count: u64,
}

impl CacheCoherencyWorker {
    /// A probe for core `thread_id` of `thread_count`, doing `inc_count`
    /// increments per verification round.
    #[must_use]
    pub fn new(arena: Arc<CcArena>, thread_id: usize, thread_count: usize, inc_count: u64) -> Self {
        Self { arena, thread_id, thread_count, inc_count }
    }

    /// Byte offset for this thread at `line`: reversed for odd threads on
    /// odd lines, so counters from distant cores land adjacent and their
    /// lines ping between those caches.
    #[inline]
    fn offset_for(&self, line: usize) -> usize {
        if line & self.thread_id & 1 != 0 {
            (self.thread_count & !1) - self.thread_id
        } else {
            self.thread_id
        }
    }
}

impl Worker for CacheCoherencyWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CacheCoherency
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(Severity::Debug, "starting cache coherency thread");
        let line_count = self.arena.record_count();

        let mut seed = (self.thread_id as u64 + 1)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            | 1;
        let start = Instant::now();
        let mut total_inc: u64 = 0;
        let mut paused = false;

        while ctx.should_continue(&mut paused) {
            for _ in 0..self.inc_count {
                seed = simple_random(seed);
                let line = (seed % line_count as u64) as usize;
                self.arena.increment(line, self.offset_for(line));
            }
            total_inc += self.inc_count;

            // Collect this thread's counters back out of every line,
            // zeroing them for the next round.
            let mut global: u64 = 0;
            for line in 0..line_count {
                global += u64::from(self.arena.take_and_zero(line, self.offset_for(line)));
            }
            if ctx.error_injection {
                global = global.wrapping_sub(1);
            }

            // Counters are bytes, so compare modulo 256. A real coherency
            // loss affecting all cores has a vanishing chance of hiding
            // from every thread at once.
            if global & 0xff != self.inc_count & 0xff {
                ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                ctx.add_diagnosis(
                    CACHE_COHERENCY_FAIL,
                    DiagnosisKind::Fail,
                    format!(
                        "global ({global}) and local ({}) cacheline counters do not match",
                        self.inc_count
                    ),
                );
            }
        }

        let elapsed_us = start.elapsed().as_micros().max(1) as u64;
        let inc_rate = total_inc as f64 * 1e6 / elapsed_us as f64;
        ctx.step.add_measurement(
            &format!("Cache Coherency Thread {} Runtime", self.thread_id),
            "us",
            elapsed_us as f64,
        );
        ctx.step.add_measurement(
            &format!("Cache Coherency Thread {} Total Increments", self.thread_id),
            "increments",
            total_inc as f64,
        );
        ctx.step.add_measurement(
            &format!("Cache Coherency Thread {} Increment Rate", self.thread_id),
            "increments/s",
            inc_rate,
        );
        ctx.log(Severity::Debug, "finished cache coherency thread");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::tests::test_context;
    use crate::workers::WorkerStats;

    #[test]
    fn test_arena_counters_are_independent() {
        let arena = CcArena::new(2, 64, 4).unwrap();
        arena.increment(0, 0);
        arena.increment(0, 0);
        arena.increment(1, 3);
        assert_eq!(arena.take_and_zero(0, 0), 2);
        assert_eq!(arena.take_and_zero(0, 0), 0);
        assert_eq!(arena.take_and_zero(1, 3), 1);
        assert_eq!(arena.take_and_zero(0, 3), 0);
    }

    #[test]
    fn test_simple_random_cycles_without_sticking() {
        let mut seed = 1u64;
        let mut seen_zero = false;
        for _ in 0..10_000 {
            seed = simple_random(seed);
            if seed == 0 {
                seen_zero = true;
            }
        }
        assert!(!seen_zero, "LFSR must never reach the absorbing state");
    }

    #[test]
    fn test_offset_inversion_for_odd_threads() {
        let arena = Arc::new(CcArena::new(4, 64, 8).unwrap());
        let even = CacheCoherencyWorker::new(Arc::clone(&arena), 2, 8, 10);
        let odd = CacheCoherencyWorker::new(Arc::clone(&arena), 3, 8, 10);

        // Even threads never invert; odd threads invert on odd lines.
        assert_eq!(even.offset_for(0), 2);
        assert_eq!(even.offset_for(1), 2);
        assert_eq!(odd.offset_for(0), 3);
        assert_eq!(odd.offset_for(1), 8 - 3);
    }

    #[test]
    fn test_local_global_sums_match_on_healthy_hardware() {
        // Spec seed scenario: K=1000, C=2, every thread's sum equals
        // K mod 256 and no diagnosis fires.
        let threads = 4;
        let arena = Arc::new(CcArena::new(2, 64, threads).unwrap());
        let mut handles = Vec::new();
        for t in 0..threads {
            let arena = Arc::clone(&arena);
            handles.push(std::thread::spawn(move || {
                let mut ctx = test_context(1, 4096, false);
                ctx.kind = WorkerKind::CacheCoherency;
                ctx.stats = WorkerStats::new();
                ctx.status.initialize();
                // One round, then stop.
                let stopper = {
                    let status = Arc::clone(&ctx.status);
                    std::thread::spawn(move || {
                        std::thread::sleep(std::time::Duration::from_millis(40));
                        status.stop_workers();
                    })
                };
                let mut worker = CacheCoherencyWorker::new(arena, t, threads, 1000);
                assert!(worker.run(&ctx));
                stopper.join().unwrap();
                assert_eq!(ctx.stats.errors.load(Ordering::Relaxed), 0);
                assert_eq!(ctx.step.fail_count(), 0);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_error_injection_forces_diagnosis() {
        let arena = Arc::new(CcArena::new(2, 64, 2).unwrap());
        let mut ctx = test_context(1, 4096, false);
        ctx.kind = WorkerKind::CacheCoherency;
        ctx.error_injection = true;
        ctx.status.initialize();
        let stopper = {
            let status = Arc::clone(&ctx.status);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                status.stop_workers();
            })
        };
        let mut worker = CacheCoherencyWorker::new(arena, 0, 2, 100);
        assert!(worker.run(&ctx));
        stopper.join().unwrap();
        assert!(ctx.stats.errors.load(Ordering::Relaxed) > 0);
    }
}
