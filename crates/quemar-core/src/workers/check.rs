//! Memory check worker: verifies pages until the pool runs dry.
//!
//! Mid-run, checked pages go back on the valid side. Once the stop signal
//! is up, checked pages are parked empty instead, so a set of check
//! workers drains the pool and every page gets a final verification.

use std::sync::atomic::Ordering;

use crate::telemetry::Severity;
use crate::workers::{crc_check_page, Worker, WorkerContext, WorkerKind};

/// Verifies pages; drains the pool during shutdown.
pub struct CheckWorker;

impl Worker for CheckWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Check
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(Severity::Debug, "starting check thread");
        let mut result = true;
        let mut loops = 0u64;

        loop {
            ctx.stats.iterations.fetch_add(1, Ordering::Relaxed);
            let mut lease = match ctx.pool.take_valid(None, &ctx.step) {
                Ok(lease) => lease,
                Err(_) => {
                    // Out of pages: an error mid-run, the expected end of
                    // the drain during shutdown.
                    if ctx.should_continue_no_pause() {
                        ctx.add_process_error("check thread failed to pop pages");
                        result = false;
                    }
                    break;
                }
            };

            crc_check_page(ctx, &mut lease);

            let pushed = if ctx.should_continue_no_pause() {
                ctx.pool.put_valid(lease)
            } else {
                ctx.pool.put_empty(lease)
            };
            if let Err(e) = pushed {
                ctx.add_process_error(format!("check thread failed to push pages: {e}"));
                result = false;
                break;
            }
            loops += 1;
        }

        ctx.stats.pages_copied.store(loops, Ordering::Relaxed);
        ctx.log(
            Severity::Debug,
            format!(
                "check thread completed with status {}, {loops} pages checked",
                if result { "Success" } else { "Fail" }
            ),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PageKind;
    use crate::workers::fill::FillWorker;
    use crate::workers::tests::test_context;
    use crate::workers::WorkerStats;

    #[test]
    fn test_check_worker_drains_pool_when_stopped() {
        let mut ctx = test_context(6, 4096, false);
        ctx.status.initialize();
        ctx.kind = WorkerKind::Fill;
        assert!(FillWorker::new(6).run(&ctx));

        ctx.kind = WorkerKind::Check;
        ctx.stats = WorkerStats::new();
        ctx.status.stop_workers();

        let mut worker = CheckWorker;
        assert!(worker.run(&ctx));

        // Every page checked exactly once and parked empty.
        assert_eq!(ctx.stats.pages_copied.load(Ordering::Relaxed), 6);
        assert!(ctx.pool.take_valid(None, &ctx.step).is_err());
        assert!(ctx.pool.take_empty(None, &ctx.step).is_ok());
        assert_eq!(ctx.step.fail_count(), 0);
    }

    #[test]
    fn test_check_worker_finds_corruption_during_drain() {
        let mut ctx = test_context(2, 4096, false);
        ctx.status.initialize();
        ctx.kind = WorkerKind::Fill;
        assert!(FillWorker::new(2).run(&ctx));

        // Corrupt one page behind the pool's back.
        {
            let mut lease = ctx.pool.take_valid(None, &ctx.step).unwrap();
            let words = lease.words_mut(4096);
            words[7] ^= 0x1;
            ctx.pool.put_valid(lease).unwrap();
        }

        ctx.kind = WorkerKind::Check;
        ctx.stats = WorkerStats::new();
        ctx.status.stop_workers();
        let mut worker = CheckWorker;
        assert!(worker.run(&ctx));
        assert_eq!(ctx.step.fail_count(), 1);
        assert_eq!(ctx.stats.errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drain_leaves_no_valid_pages() {
        let mut ctx = test_context(4, 4096, false);
        ctx.status.initialize();
        ctx.kind = WorkerKind::Fill;
        assert!(FillWorker::new(4).run(&ctx));
        ctx.status.stop_workers();

        ctx.kind = WorkerKind::Check;
        let mut worker = CheckWorker;
        assert!(worker.run(&ctx));
        assert!(matches!(
            ctx.pool.take_valid(None, &ctx.step),
            Err(crate::Error::NoPageAvailable(PageKind::Valid))
        ));
    }
}
