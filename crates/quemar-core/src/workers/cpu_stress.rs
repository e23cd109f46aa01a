//! CPU stress worker: pure computational load, no pass/fail evaluation.

use crate::telemetry::Severity;
use crate::workers::{yield_self, Worker, WorkerContext, WorkerKind};

/// Burns CPU with the floating-point workload until stopped.
pub struct CpuStressWorker;

impl Worker for CpuStressWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CpuStress
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(Severity::Debug, "starting CPU stress thread");
        let mut paused = false;
        while ctx.should_continue(&mut paused) {
            ctx.os.cpu_stress_workload();
            yield_self();
        }
        ctx.log(Severity::Debug, "finished CPU stress thread");
        true
    }
}
