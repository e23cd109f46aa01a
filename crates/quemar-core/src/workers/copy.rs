//! Memory copy worker: moves pages between slots under CRC verification.

use std::sync::atomic::Ordering;

use crate::os;
use crate::telemetry::Severity;
use crate::workers::{
    crc_copy_page, crc_warm_copy_page, yield_self, Worker, WorkerContext, WorkerKind,
};

const RAND_MUL: u64 = 2_862_933_555_777_941_757;
const RAND_INC: u64 = 3_037_000_493;

/// Copies valid pages onto empty pages until stopped.
pub struct CopyWorker {
    inject_seed: u64,
}

impl CopyWorker {
    /// A copy worker; `seed` decorrelates the fault-injection schedule
    /// between workers.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { inject_seed: seed.wrapping_add(0xbeef) }
    }

    fn next_random(&mut self) -> u64 {
        self.inject_seed = self.inject_seed.wrapping_mul(RAND_MUL).wrapping_add(RAND_INC);
        self.inject_seed
    }

    /// Roughly one iteration in fifty thousand, corrupt one source byte to
    /// exercise the miscompare path end to end.
    fn maybe_inject(&mut self, ctx: &WorkerContext, vaddr: usize) {
        if !ctx.error_injection {
            return;
        }
        if self.next_random() % 50_000 == 8 {
            let offset = (self.next_random() as usize) % ctx.page_len;
            // SAFETY: offset lies inside the page this worker holds.
            unsafe {
                std::ptr::write_volatile((vaddr + offset) as *mut u8, 0xba);
            }
        }
    }
}

impl Worker for CopyWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Copy
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(
            Severity::Debug,
            format!(
                "starting memory copy thread, tag {:?}, warming {}, vector {}",
                ctx.tag,
                if ctx.warm { "yes" } else { "no" },
                if ctx.os.has_vector() { "yes" } else { "no" },
            ),
        );

        let mut result = true;
        let mut loops = 0u64;
        let mut paused = false;

        while ctx.should_continue(&mut paused) {
            let mut src = match ctx.pool.take_valid(ctx.tag, &ctx.step) {
                Ok(lease) => lease,
                Err(e) => {
                    // A dry pool during shutdown just means the check
                    // workers drained it first.
                    if ctx.should_continue_no_pause() {
                        ctx.add_process_error(format!("failed to pop pages: {e}"));
                        result = false;
                    }
                    break;
                }
            };
            let mut dst = match ctx.pool.take_empty(ctx.tag, &ctx.step) {
                Ok(lease) => lease,
                Err(e) => {
                    let _ = ctx.pool.put_valid(src);
                    if ctx.should_continue_no_pause() {
                        ctx.add_process_error(format!("failed to pop pages: {e}"));
                        result = false;
                    }
                    break;
                }
            };

            self.maybe_inject(ctx, src.vaddr);

            if ctx.warm {
                crc_warm_copy_page(ctx, &mut dst, &mut src);
            } else if ctx.strict {
                crc_copy_page(ctx, &mut dst, &mut src);
            } else {
                // Loose mode: plain copy, no verification.
                let page_len = ctx.page_len;
                // SAFETY: both leases map distinct pages held exclusively.
                unsafe {
                    let s = src.words_unchecked(page_len);
                    let d = dst.words_unchecked(page_len);
                    d.copy_from_slice(s);
                }
                dst.pattern = src.pattern.clone();
                dst.last_cpu = os::current_cpu();
            }

            let pushed = ctx.pool.put_valid(dst).and_then(|()| ctx.pool.put_empty(src));
            // Yield between copies so copy workers do not preempt each
            // other mid-sweep and thrash the caches.
            yield_self();

            if let Err(e) = pushed {
                ctx.add_process_error(format!("failed to push pages: {e}"));
                result = false;
                break;
            }
            loops += 1;
        }

        ctx.stats.pages_copied.store(loops, Ordering::Relaxed);
        ctx.log(
            Severity::Debug,
            format!(
                "status {}, {loops} pages copied",
                if result { "Success" } else { "Fail" }
            ),
        );
        result
    }
}
