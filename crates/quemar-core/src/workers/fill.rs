//! Startup fill worker: labels empty pages with random patterns and writes
//! them out.

use std::sync::atomic::Ordering;

use crate::pool::PageLease;
use crate::telemetry::Severity;
use crate::workers::{fill_page, Worker, WorkerContext, WorkerKind};

/// Fills a fixed quota of pages, then exits.
pub struct FillWorker {
    pages_to_fill: u64,
}

impl FillWorker {
    /// A worker that will fill `pages_to_fill` pages.
    #[must_use]
    pub fn new(pages_to_fill: u64) -> Self {
        Self { pages_to_fill }
    }

    fn fill_random(&self, ctx: &WorkerContext, lease: &mut PageLease<'_>) -> bool {
        if ctx.patterns.is_empty() {
            ctx.log(Severity::Error, "no data patterns available to fill pages with");
            return false;
        }
        lease.pattern = Some(ctx.patterns.random_pattern());
        fill_page(ctx, lease)
    }
}

impl Worker for FillWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Fill
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(Severity::Debug, "starting memory page fill thread");
        let mut result = true;
        let mut loops = 0u64;
        let mut paused = false;

        while ctx.should_continue(&mut paused) && loops < self.pages_to_fill {
            let mut lease = match ctx.pool.take_empty(None, &ctx.step) {
                Ok(lease) => lease,
                Err(e) => {
                    ctx.log(Severity::Error, format!("failed to pop pages, exiting thread: {e}"));
                    result = false;
                    break;
                }
            };

            if !self.fill_random(ctx, &mut lease) {
                let _ = ctx.pool.put_empty(lease);
                result = false;
                break;
            }

            if let Err(e) = ctx.pool.put_valid(lease) {
                ctx.log(Severity::Error, format!("failed to push pages, exiting thread: {e}"));
                result = false;
                break;
            }
            loops += 1;
        }

        ctx.stats.pages_copied.store(loops, Ordering::Relaxed);
        ctx.log(
            Severity::Debug,
            format!(
                "completed, status {}, filled {loops} pages",
                if result { "Success" } else { "Fail" }
            ),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::tests::test_context;
    use crate::workers::{crc_check_page, WorkerStats};

    #[test]
    fn test_fill_worker_fills_quota() {
        let mut ctx = test_context(8, 4096, false);
        ctx.kind = WorkerKind::Fill;
        ctx.stats = WorkerStats::new();
        ctx.status.initialize();

        let mut worker = FillWorker::new(8);
        assert!(worker.run(&ctx));
        assert_eq!(ctx.stats.pages_copied.load(Ordering::Relaxed), 8);

        // Every page is now valid and verifies cleanly.
        for _ in 0..8 {
            let mut lease = ctx.pool.take_valid(None, &ctx.step).unwrap();
            assert_eq!(crc_check_page(&ctx, &mut lease), 0);
            ctx.pool.put_empty(lease).unwrap();
        }
    }

    #[test]
    fn test_fill_worker_fails_without_empty_pages() {
        let mut ctx = test_context(2, 4096, false);
        ctx.kind = WorkerKind::Fill;
        ctx.status.initialize();

        // Ask for more pages than exist: the worker fills what it can,
        // then reports a pop failure.
        let mut worker = FillWorker::new(5);
        assert!(!worker.run(&ctx));
        assert_eq!(ctx.stats.pages_copied.load(Ordering::Relaxed), 2);
    }
}
