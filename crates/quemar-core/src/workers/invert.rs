//! Memory invert worker: four in-place inversion sweeps per page.
//!
//! Each sweep flips every 32-bit word with a cacheline flush per line, so
//! the inverted data round-trips through DRAM rather than the cache. Four
//! inversions restore the original content, which keeps the page's catalog
//! pattern truthful for the CRC checks bracketing the sweeps.

use std::sync::atomic::Ordering;

use crate::os;
use crate::pool::PageLease;
use crate::simd::{self, CACHE_LINE_SIZE};
use crate::telemetry::Severity;
use crate::workers::{crc_check_page, yield_self, Worker, WorkerContext, WorkerKind};

const FLUSH_INTERVAL: usize = CACHE_LINE_SIZE / 4;

fn invert_page_up(ctx: &WorkerContext, lease: &mut PageLease<'_>) {
    let words = lease.half_words_mut(ctx.page_len);
    simd::fast_flush_sync();
    let mut i = 0;
    while i + FLUSH_INTERVAL <= words.len() {
        for j in i..i + FLUSH_INTERVAL {
            words[j] = !words[j];
        }
        simd::fast_flush_hint(std::ptr::addr_of!(words[i]).cast());
        i += FLUSH_INTERVAL;
    }
    simd::fast_flush_sync();
    lease.last_cpu = os::current_cpu();
}

fn invert_page_down(ctx: &WorkerContext, lease: &mut PageLease<'_>) {
    let words = lease.half_words_mut(ctx.page_len);
    simd::fast_flush_sync();
    let mut i = words.len();
    while i >= FLUSH_INTERVAL {
        for j in (i - FLUSH_INTERVAL..i).rev() {
            words[j] = !words[j];
        }
        i -= FLUSH_INTERVAL;
        simd::fast_flush_hint(std::ptr::addr_of!(words[i]).cast());
    }
    simd::fast_flush_sync();
    lease.last_cpu = os::current_cpu();
}

/// Inverts pages in place until stopped.
pub struct InvertWorker;

impl Worker for InvertWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Invert
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(Severity::Debug, "starting memory invert thread");
        let mut result = true;
        let mut loops = 0u64;
        let mut paused = false;

        while ctx.should_continue(&mut paused) {
            let mut src = match ctx.pool.take_valid(None, &ctx.step) {
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

            if ctx.strict {
                crc_check_page(ctx, &mut src);
            }

            invert_page_up(ctx, &mut src);
            yield_self();
            invert_page_down(ctx, &mut src);
            yield_self();
            invert_page_down(ctx, &mut src);
            yield_self();
            invert_page_up(ctx, &mut src);
            yield_self();

            if ctx.strict {
                crc_check_page(ctx, &mut src);
            }

            if let Err(e) = ctx.pool.put_valid(src) {
                ctx.add_process_error(format!("failed to push pages: {e}"));
                result = false;
                break;
            }
            loops += 1;
        }

        // Four sweeps read and write the page twice over.
        ctx.stats.pages_copied.store(loops * 2, Ordering::Relaxed);
        ctx.log(
            Severity::Debug,
            format!(
                "invert thread completed with status {}, {} pages copied",
                if result { "Success" } else { "Fail" },
                loops * 2
            ),
        );
        result
    }
}
