//! The OS and hardware interface layer.
//!
//! Everything the verification engine needs from below: the test arena,
//! virtual-to-physical translation, DIMM decode, region arithmetic, CPU
//! topology and affinity, MSR access, cacheline flushes, and the
//! SIMD-assisted warm copy. Platform hacks live here, behind stubs for
//! non-Linux targets.

mod mem;

pub use mem::TestMem;

use std::io::{Read, Seek, SeekFrom, Write};

use nix::libc;
use nix::sched::CpuSet;
use nix::unistd::Pid;

use crate::checksum::{self, AdlerChecksum};
use crate::simd::{self, CpuCaps};
use crate::telemetry::{Severity, Step};
use crate::{Error, Result};

/// Smallest region a physical address can be classified into.
const MIN_REGION_BYTES: u64 = 512 * 1024 * 1024;

const PAGEMAP_PATH: &str = "/proc/self/pagemap";

/// DIMM decode parameters: a channel-interleave specification supplied by
/// the user.
#[derive(Debug, Clone)]
pub struct DramMap {
    /// Address bits XOR-reduced to select the channel.
    pub channel_hash: u64,
    /// Channel width in bits.
    pub channel_width: u64,
    /// Chip names per channel.
    pub channels: Vec<Vec<String>>,
}

/// Access to model-specific registers, a seam so probes can be driven by
/// stub registers in tests.
pub trait MsrSource: Send + Sync {
    /// Read the MSR at `addr` on `cpu`.
    ///
    /// # Errors
    ///
    /// Fails when the register is unreadable (no driver, no permission,
    /// offline CPU).
    fn read_msr(&self, cpu: u32, addr: u32) -> Result<u64>;

    /// Write the MSR at `addr` on `cpu`.
    ///
    /// # Errors
    ///
    /// As for [`Self::read_msr`].
    fn write_msr(&self, cpu: u32, addr: u32, value: u64) -> Result<()>;
}

/// MSR access through the Linux `msr` driver.
#[derive(Debug, Default)]
pub struct DevMsr;

impl MsrSource for DevMsr {
    fn read_msr(&self, cpu: u32, addr: u32) -> Result<u64> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let mut file = std::fs::File::open(path).map_err(|e| Error::os("msr open", e))?;
        file.seek(SeekFrom::Start(u64::from(addr)))
            .map_err(|e| Error::os("msr seek", e))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).map_err(|e| Error::os("msr read", e))?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn write_msr(&self, cpu: u32, addr: u32, value: u64) -> Result<()> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| Error::os("msr open", e))?;
        file.seek(SeekFrom::Start(u64::from(addr)))
            .map_err(|e| Error::os("msr seek", e))?;
        file.write_all(&value.to_ne_bytes())
            .map_err(|e| Error::os("msr write", e))
    }
}

/// The OS abstraction consumed by the engine and workers.
pub struct OsLayer {
    caps: CpuCaps,
    num_cpus: usize,
    num_nodes: usize,
    num_cpus_per_node: usize,
    region_size: u64,
    region_count: u64,
    dram: Option<DramMap>,
    msr: Box<dyn MsrSource>,
}

impl OsLayer {
    /// Probe the machine and build the layer.
    ///
    /// # Errors
    ///
    /// Currently infallible on supported platforms; kept fallible as the
    /// contract for platforms where probing can refuse.
    pub fn new(dram: Option<DramMap>, step: &Step) -> Result<Self> {
        let caps = CpuCaps::detect();
        let num_cpus = Self::cpu_count();
        let num_nodes = Self::node_count();
        let num_cpus_per_node = (num_cpus / num_nodes).max(1);

        let total = Self::total_mem_bytes();
        let region_size = (total / 8).max(MIN_REGION_BYTES);
        let region_count = (total / region_size).max(1);

        step.add_measurement("CPU Core Count", "cores", num_cpus as f64);
        step.add_measurement("Node Count", "nodes", num_nodes as f64);
        step.log(
            Severity::Debug,
            format!(
                "CPU {} clflush and {} sse2",
                if caps.clflush { "has" } else { "does not have" },
                if caps.sse2 { "has" } else { "does not have" }
            ),
        );

        Ok(Self {
            caps,
            num_cpus,
            num_nodes,
            num_cpus_per_node,
            region_size,
            region_count,
            dram,
            msr: Box::new(DevMsr),
        })
    }

    /// Replace the MSR source (used by tests and simulators).
    pub fn set_msr_source(&mut self, msr: Box<dyn MsrSource>) {
        self.msr = msr;
    }

    /// Detected CPU capabilities.
    #[must_use]
    pub fn caps(&self) -> CpuCaps {
        self.caps
    }

    /// Whether the vector copy path is available.
    #[must_use]
    pub fn has_vector(&self) -> bool {
        self.caps.has_vector()
    }

    /// Online CPU count.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// NUMA node count (1 when not discoverable).
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of address regions.
    #[must_use]
    pub fn region_count(&self) -> u64 {
        self.region_count
    }

    fn cpu_count() -> usize {
        // SAFETY: sysconf is always safe to call.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        usize::try_from(n).unwrap_or(1).max(1)
    }

    #[cfg(target_os = "linux")]
    fn node_count() -> usize {
        let mut count = 0;
        while std::path::Path::new(&format!("/sys/devices/system/node/node{count}")).exists() {
            count += 1;
        }
        count.max(1)
    }

    #[cfg(not(target_os = "linux"))]
    fn node_count() -> usize {
        1
    }

    #[cfg(target_os = "linux")]
    fn total_mem_bytes() -> u64 {
        meminfo_kb("MemTotal:").map_or(1 << 30, |kb| kb * 1024)
    }

    #[cfg(not(target_os = "linux"))]
    fn total_mem_bytes() -> u64 {
        1 << 30
    }

    /// Free memory available for an auto-sized arena, in bytes.
    #[must_use]
    pub fn find_free_mem_bytes(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            meminfo_kb("MemAvailable:")
                .or_else(|| meminfo_kb("MemFree:"))
                .map_or(0, |kb| kb * 1024)
        }
        #[cfg(not(target_os = "linux"))]
        {
            256 * 1024 * 1024
        }
    }

    /// Allocate the test arena.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] when no strategy can supply `bytes`.
    pub fn allocate_test_mem(
        &self,
        bytes: usize,
        min_hugepage_bytes: u64,
        step: &Step,
    ) -> Result<TestMem> {
        TestMem::allocate(bytes, min_hugepage_bytes, step)
    }

    /// Translate a user virtual address to a physical address, or 0 when
    /// the page map is unreadable (no privilege, page not present).
    #[must_use]
    pub fn virtual_to_physical(&self, vaddr: usize) -> u64 {
        // SAFETY: sysconf is always safe to call.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let offset = (vaddr / page_size * 8) as u64;

        let Ok(mut file) = std::fs::File::open(PAGEMAP_PATH) else {
            return 0;
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return 0;
        }
        let mut buf = [0u8; 8];
        if file.read_exact(&mut buf).is_err() {
            return 0;
        }
        let frame = u64::from_ne_bytes(buf);

        // Bit 63: present. Bit 62: swapped. Bits 0-54: page frame number.
        if frame & (1 << 63) == 0 || frame & (1 << 62) != 0 {
            return 0;
        }
        let pfn = frame & ((1 << 55) - 1);
        pfn * page_size as u64 | (vaddr as u64 & (page_size as u64 - 1))
    }

    /// Translate a physical address to a DIMM label through the configured
    /// channel-interleave map.
    #[must_use]
    pub fn find_dimm(&self, paddr: u64) -> String {
        let Some(dram) = &self.dram else {
            return "DIMM Unknown".to_string();
        };

        // Channel selected by XOR-reducing the address bits in the hash
        // mask.
        let hashed = paddr & dram.channel_hash;
        let parity = (hashed.count_ones() & 1) as usize;
        let channel = &dram.channels[parity % dram.channels.len()];

        // Byte lane within the channel width, divided evenly among the
        // listed chips. Does not model x4 parts.
        let bytes_per_channel = dram.channel_width / 8;
        let per_chip = (bytes_per_channel / channel.len() as u64).max(1);
        let chip = ((paddr % bytes_per_channel) / per_chip) as usize;
        channel[chip.min(channel.len() - 1)].clone()
    }

    /// Classify a physical address into a fixed-size region.
    #[must_use]
    pub fn find_region(&self, paddr: u64) -> u32 {
        let region = paddr / self.region_size;
        (region % self.region_count) as u32
    }

    /// The CPUs associated with a region's node.
    #[must_use]
    pub fn find_core_mask(&self, region: u32) -> CpuSet {
        let node = region as usize % self.num_nodes;
        let mut set = CpuSet::new();
        for i in 0..self.num_cpus_per_node {
            let cpu = i + node * self.num_cpus_per_node;
            if cpu < CpuSet::count() {
                let _ = set.set(cpu);
            }
        }
        set
    }

    /// Flush the cacheline holding `vaddr`, when the CPU can.
    pub fn flush(&self, vaddr: usize) {
        if self.caps.clflush {
            simd::flush(vaddr as *const u8);
        }
    }

    /// Read an MSR on a CPU.
    ///
    /// # Errors
    ///
    /// Propagates the source's failure.
    pub fn read_msr(&self, cpu: u32, addr: u32) -> Result<u64> {
        self.msr.read_msr(cpu, addr)
    }

    /// Write an MSR on a CPU.
    ///
    /// # Errors
    ///
    /// Propagates the source's failure.
    pub fn write_msr(&self, cpu: u32, addr: u32, value: u64) -> Result<()> {
        self.msr.write_msr(cpu, addr, value)
    }

    /// Vector or scalar copy-with-checksum, whichever the CPU supports.
    ///
    /// # Errors
    ///
    /// Propagates checksum length errors.
    pub fn adler_memcpy_warm(
        &self,
        dst: &mut [u64],
        src: &[u64],
        checksum_out: &mut AdlerChecksum,
    ) -> Result<()> {
        if self.caps.has_vector() {
            simd::adler_memcpy_warm(dst, src, checksum_out)
        } else {
            checksum::adler_memcpy(dst, src, checksum_out)
        }
    }

    /// Worst-case cacheline size across the cache levels, at least 64.
    #[must_use]
    pub fn cache_line_size(&self) -> usize {
        let mut max_line = simd::CACHE_LINE_SIZE;
        for index in 0..4 {
            let path = format!(
                "/sys/devices/system/cpu/cpu0/cache/index{index}/coherency_line_size"
            );
            if let Some(line) = std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
            {
                max_line = max_line.max(line);
            }
        }
        max_line
    }

    /// Floating-point moving-average busy loop. Exists to turn watts into
    /// heat; results are deliberately discarded.
    pub fn cpu_stress_workload(&self) {
        let mut values = [0f64; 100];
        let mut seed: u64 = 12345;
        for v in &mut values {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            *v = (seed >> 11) as f64;
            if seed & 1 == 1 {
                *v = -*v;
            }
        }

        let mut sum = 0f64;
        for i in 0..10_000_000usize {
            values[i % 100] = (values[i % 100] + values[(i + 1) % 100] + values[(i + 99) % 100]) / 3.0;
            sum += values[i % 100];
        }
        std::hint::black_box(sum);
    }
}

#[cfg(target_os = "linux")]
fn meminfo_kb(field: &str) -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

/// CPUs this process may run on.
#[must_use]
pub fn available_cpus() -> CpuSet {
    nix::sched::sched_getaffinity(Pid::from_raw(0)).unwrap_or_else(|_| {
        let mut set = CpuSet::new();
        let _ = set.set(0);
        set
    })
}

/// Bind the calling thread to `set`.
///
/// # Errors
///
/// Fails when the kernel rejects the mask (offline CPUs, cgroup limits).
pub fn bind_to_cpus(set: &CpuSet) -> Result<()> {
    nix::sched::sched_setaffinity(Pid::from_raw(0), set)
        .map_err(|e| Error::os("sched_setaffinity", e.into()))
}

/// The CPU the calling thread is currently on.
#[must_use]
pub fn current_cpu() -> u32 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getcpu has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        u32::try_from(cpu).unwrap_or(0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// Number of CPUs set in a mask.
#[must_use]
pub fn cpuset_count(set: &CpuSet) -> usize {
    (0..CpuSet::count())
        .filter(|&i| set.is_set(i).unwrap_or(false))
        .count()
}

/// Hex rendering of a CPU mask, lowest CPU in the lowest bit.
#[must_use]
pub fn cpuset_format(set: &CpuSet) -> String {
    let mut bits: u128 = 0;
    for i in 0..CpuSet::count().min(128) {
        if set.is_set(i).unwrap_or(false) {
            bits |= 1 << i;
        }
    }
    format!("{bits:x}")
}

/// A mask holding CPUs `start..end`.
#[must_use]
pub fn cpuset_range(start: usize, end: usize) -> CpuSet {
    let mut set = CpuSet::new();
    for cpu in start..end.min(CpuSet::count()) {
        let _ = set.set(cpu);
    }
    set
}
