//! CPU-frequency probe: watches every core's effective frequency through
//! the TSC/APERF/MPERF registers and diagnoses cores running below the
//! configured threshold.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::os::MsrSource;
use crate::telemetry::{DiagnosisKind, Severity, Step, CPU_FREQUENCY_TOO_LOW_FAIL, PROCESS_ERROR};
use crate::workers::{Worker, WorkerContext, WorkerKind};

/// Time-stamp counter MSR.
pub const MSR_TSC: u32 = 0x10;
/// Actual-performance clock counter MSR.
pub const MSR_APERF: u32 = 0xE8;
/// Maximum-performance clock counter MSR.
pub const MSR_MPERF: u32 = 0xE7;

const MSR_ADDRS: [(u32, &str); 3] = [(MSR_TSC, "TSC"), (MSR_APERF, "APERF"), (MSR_MPERF, "MPERF")];

/// One sampling of the three registers on one CPU.
#[derive(Debug, Clone, Copy, Default)]
struct CpuSample {
    msrs: [u64; 3],
    at: Option<Instant>,
}

/// Whether the machine advertises the capabilities the probe needs: TSC,
/// invariant TSC, non-stop TSC, and the APERF/MPERF pair.
#[must_use]
pub fn can_run(step: &Step) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: cpuid is unprivileged on x86_64.
        let leaf1 = unsafe { std::arch::x86_64::__cpuid(1) };
        if leaf1.edx & (1 << 4) == 0 {
            step.add_error(PROCESS_ERROR, "cannot run CPU frequency probe: no TSC");
            return false;
        }

        let highest_ext = unsafe { std::arch::x86_64::__cpuid(0x8000_0000) };
        if highest_ext.eax < 0x8000_0007 {
            step.add_error(PROCESS_ERROR, "cannot run CPU frequency probe: no invariant TSC");
            return false;
        }

        // Non-stop TSC is CPUID.0x80000007:EDX bit 8 on both vendors.
        let power = unsafe { std::arch::x86_64::__cpuid(0x8000_0007) };
        if power.edx & (1 << 8) == 0 {
            step.add_error(PROCESS_ERROR, "cannot run CPU frequency probe: no non-stop TSC");
            return false;
        }

        // APERF/MPERF is CPUID.6:ECX bit 0.
        let thermal = unsafe { std::arch::x86_64::__cpuid(6) };
        if thermal.ecx & 1 == 0 {
            step.add_error(PROCESS_ERROR, "cannot run CPU frequency probe: no APERF MSR");
            return false;
        }
        true
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        step.add_error(
            PROCESS_ERROR,
            "cannot run CPU frequency probe: only supported on x86 platforms",
        );
        false
    }
}

/// Samples every CPU each interval and diagnoses slow cores.
pub struct CpuFreqWorker {
    num_cpus: usize,
    threshold_mhz: u32,
    round_mhz: u32,
    round_value: f64,
    msr: Arc<dyn MsrSource>,
    interval: Duration,
    startup_delay: Duration,
}

impl CpuFreqWorker {
    /// A probe over `num_cpus` cores with the stock 10 s interval and 5 s
    /// settle delay. `round_mhz` of 0 rounds to the nearest MHz.
    #[must_use]
    pub fn new(num_cpus: usize, threshold_mhz: u32, round_mhz: u32, msr: Arc<dyn MsrSource>) -> Self {
        Self::with_timing(
            num_cpus,
            threshold_mhz,
            round_mhz,
            msr,
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
    }

    /// As [`Self::new`] with explicit sampling cadence.
    #[must_use]
    pub fn with_timing(
        num_cpus: usize,
        threshold_mhz: u32,
        round_mhz: u32,
        msr: Arc<dyn MsrSource>,
        interval: Duration,
        startup_delay: Duration,
    ) -> Self {
        let (round_mhz, round_value) = if round_mhz == 0 {
            (1, 0.5)
        } else {
            (round_mhz, f64::from(round_mhz) / 2.0)
        };
        Self { num_cpus, threshold_mhz, round_mhz, round_value, msr, interval, startup_delay }
    }

    fn read_sample(&self, cpu: u32) -> Option<CpuSample> {
        let mut sample = CpuSample::default();
        for (slot, (addr, _)) in MSR_ADDRS.iter().enumerate() {
            match self.msr.read_msr(cpu, *addr) {
                Ok(value) => sample.msrs[slot] = value,
                Err(_) => return None,
            }
        }
        sample.at = Some(Instant::now());
        Some(sample)
    }

    /// Register deltas between two samples; rejects backward counters and
    /// idle-artefact intervals where the TSC barely moved.
    fn compute_delta(&self, ctx: &WorkerContext, current: &CpuSample, previous: &CpuSample) -> Option<[u64; 3]> {
        let mut delta = [0u64; 3];
        for slot in 0..MSR_ADDRS.len() {
            if previous.msrs[slot] > current.msrs[slot] {
                ctx.log(
                    Severity::Warning,
                    format!(
                        "register {} went backwards {:#x} to {:#x}, skipping interval",
                        MSR_ADDRS[slot].1, previous.msrs[slot], current.msrs[slot]
                    ),
                );
                return None;
            }
            delta[slot] = current.msrs[slot] - previous.msrs[slot];
        }
        if delta[0] < 1_000_000 {
            ctx.log(Severity::Warning, "insanely slow TSC rate, TSC stops in idle?");
            return None;
        }
        Some(delta)
    }

    /// Effective frequency in MHz across the interval, rounded to the
    /// configured grain.
    fn compute_frequency(
        &self,
        ctx: &WorkerContext,
        current: &CpuSample,
        previous: &CpuSample,
    ) -> Option<i64> {
        let delta = self.compute_delta(ctx, current, previous)?;
        let dt = current.at?.duration_since(previous.at?).as_secs_f64();
        if dt <= 0.0 || delta[2] == 0 {
            return None;
        }

        let frequency =
            delta[0] as f64 / 1e6 * (delta[1] as f64 / delta[2] as f64) / dt;
        let computed = (frequency + self.round_value) as i64;
        Some(computed - computed % i64::from(self.round_mhz))
    }

    /// Sleep in slices, bailing early when a stop comes in.
    fn sleep_unless_stopped(&self, ctx: &WorkerContext, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if !ctx.should_continue_no_pause() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10).min(duration));
        }
        true
    }
}

impl Worker for CpuFreqWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CpuFreq
    }

    fn run(&mut self, ctx: &WorkerContext) -> bool {
        ctx.log(Severity::Debug, "starting CPU frequency thread");

        let mut samples = vec![[CpuSample::default(); 2]; self.num_cpus];
        let mut series: Vec<_> = (0..self.num_cpus)
            .map(|cpu| ctx.step.series(&format!("CPU Core {cpu} Frequency"), "MHz"))
            .collect();

        let mut current = 0usize;
        let mut intervals = 0u32;
        let mut paused = false;

        while ctx.should_continue(&mut paused) {
            if paused {
                // Samples straddling a pause would show the idle dip;
                // restart the interval logic.
                intervals = 0;
            }
            if intervals == 0 && !self.sleep_unless_stopped(ctx, self.startup_delay) {
                break;
            }

            let mut valid = true;
            for cpu in 0..self.num_cpus {
                match self.read_sample(cpu as u32) {
                    Some(sample) => samples[cpu][current] = sample,
                    None => {
                        ctx.log(Severity::Warning, format!("failed to read MSRs on CPU {cpu}"));
                        valid = false;
                        break;
                    }
                }
            }
            if !valid {
                intervals = 0;
                if !self.sleep_unless_stopped(ctx, self.interval) {
                    break;
                }
                continue;
            }

            intervals += 1;
            if intervals > 2 {
                for cpu in 0..self.num_cpus {
                    let previous = samples[cpu][current ^ 1];
                    let Some(mhz) =
                        self.compute_frequency(ctx, &samples[cpu][current], &previous)
                    else {
                        ctx.log(Severity::Warning, format!("cannot get frequency of CPU {cpu}"));
                        intervals = 0;
                        break;
                    };
                    series[cpu].add_element(mhz as f64);
                    if mhz < i64::from(self.threshold_mhz) {
                        ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                        ctx.add_diagnosis(
                            CPU_FREQUENCY_TOO_LOW_FAIL,
                            DiagnosisKind::Fail,
                            format!(
                                "CPU frequency for core {cpu} is too low: {mhz} MHz < {} MHz",
                                self.threshold_mhz
                            ),
                        );
                    }
                }
            }

            if !self.sleep_unless_stopped(ctx, self.interval) {
                break;
            }
            current ^= 1;
        }

        ctx.log(Severity::Debug, "finished CPU frequency thread");
        true
    }
}
