//! Test arena allocation.
//!
//! The ladder tries the most physically-contiguous backing first, because
//! the closer pages sit together in DRAM the better a miscompare localizes
//! to one DIMM: explicit hugepages, then a POSIX shared-memory object, then
//! plain anonymous mmap, then a page-aligned heap block as the last resort.

use nix::libc;

use crate::telemetry::{Severity, Step};
use crate::{Error, Result};

/// Assumed kernel hugepage size for the availability check.
#[cfg(target_os = "linux")]
const HUGEPAGE_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    HugeMmap,
    Shm,
    Mmap,
    Heap,
}

impl AllocKind {
    fn name(self) -> &'static str {
        match self {
            Self::HugeMmap => "hugepage mmap",
            Self::Shm => "POSIX shared memory",
            Self::Mmap => "anonymous mmap",
            Self::Heap => "aligned heap",
        }
    }
}

/// The mapped test arena. Freed on drop.
pub struct TestMem {
    base: *mut u8,
    len: usize,
    kind: AllocKind,
}

// SAFETY: the arena is a plain byte range; all concurrent access above it
// is serialized page-by-page through the queue slot locks.
unsafe impl Send for TestMem {}
unsafe impl Sync for TestMem {}

/// Hugepages the kernel currently has pooled, in bytes.
#[cfg(target_os = "linux")]
fn hugepage_pool_bytes() -> u64 {
    std::fs::read_to_string("/proc/sys/vm/nr_hugepages")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0, |pages| pages * HUGEPAGE_BYTES)
}

fn mmap_flags_anon() -> libc::c_int {
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
}

unsafe fn try_mmap(len: usize, flags: libc::c_int, fd: libc::c_int) -> Option<*mut u8> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        flags,
        fd,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr.cast::<u8>())
    }
}

impl TestMem {
    /// Allocate `len` bytes of test memory, logging which strategy won.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] when every strategy fails.
    pub fn allocate(len: usize, min_hugepage_bytes: u64, step: &Step) -> Result<Self> {
        if len == 0 {
            return Err(Error::Allocation("zero-length arena".to_string()));
        }

        #[cfg(target_os = "linux")]
        {
            let pooled = hugepage_pool_bytes();
            if pooled >= len as u64 || min_hugepage_bytes > 0 {
                // SAFETY: plain anonymous mapping request; result checked.
                if let Some(base) =
                    unsafe { try_mmap(len, mmap_flags_anon() | libc::MAP_HUGETLB, -1) }
                {
                    step.log(
                        Severity::Info,
                        format!("using hugepage allocation at {base:p} ({len} bytes)"),
                    );
                    return Ok(Self { base, len, kind: AllocKind::HugeMmap });
                }
                step.log(
                    Severity::Info,
                    format!(
                        "hugepage allocation failed ({pooled} bytes pooled); use \
                         `sysctl -w vm.nr_hugepages=N` to allow hugepages"
                    ),
                );
            }

            if let Some(mem) = Self::allocate_shm(len, step) {
                return Ok(mem);
            }
        }

        // SAFETY: plain anonymous mapping request; result checked.
        if let Some(base) = unsafe { try_mmap(len, mmap_flags_anon(), -1) } {
            step.log(
                Severity::Info,
                format!("using mmap allocation at {base:p} ({len} bytes)"),
            );
            return Ok(Self { base, len, kind: AllocKind::Mmap });
        }

        let layout = std::alloc::Layout::from_size_align(len, 4096)
            .map_err(|e| Error::Allocation(format!("bad arena layout: {e}")))?;
        // SAFETY: layout is non-zero-sized; null result handled below.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::Allocation(format!(
                "all allocation strategies failed for {len} bytes"
            )));
        }
        step.log(
            Severity::Info,
            format!("using memaligned allocation at {base:p} ({len} bytes)"),
        );
        Ok(Self { base, len, kind: AllocKind::Heap })
    }

    #[cfg(target_os = "linux")]
    fn allocate_shm(len: usize, step: &Step) -> Option<Self> {
        let name = std::ffi::CString::new(format!("/quemar.{}", std::process::id())).ok()?;
        // SAFETY: name is a valid C string; fd checked below.
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o700) };
        if fd < 0 {
            return None;
        }

        let mapped = unsafe {
            // SAFETY: fd is open; ftruncate/mmap results are checked; the
            // object is unlinked and the fd closed whatever the outcome.
            let sized = libc::ftruncate(fd, len as libc::off_t) == 0;
            let base = if sized {
                try_mmap(len, libc::MAP_SHARED | libc::MAP_NORESERVE | libc::MAP_POPULATE, fd)
            } else {
                None
            };
            libc::shm_unlink(name.as_ptr());
            libc::close(fd);
            base
        };

        mapped.map(|base| {
            step.log(
                Severity::Info,
                format!("using POSIX shared memory object at {base:p} ({len} bytes)"),
            );
            Self { base, len, kind: AllocKind::Shm }
        })
    }

    /// Arena size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena is empty (never after a successful allocation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name of the winning allocation strategy.
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        self.kind.name()
    }

    /// Map the page at `offset` and return its address.
    ///
    /// The arena is statically mapped, so this is bounds-checked pointer
    /// arithmetic; it exists as a seam for dynamically mapped arenas.
    #[must_use]
    pub fn prepare(&self, offset: u64, len: u64) -> usize {
        if offset + len > self.len as u64 {
            return 0;
        }
        // SAFETY: offset is within the mapping, checked above.
        unsafe { self.base.add(offset as usize) as usize }
    }

    /// Release a previously prepared mapping. A no-op for static arenas.
    pub fn release(&self, _addr: usize, _offset: u64, _len: u64) {}
}

impl Drop for TestMem {
    fn drop(&mut self) {
        match self.kind {
            AllocKind::HugeMmap | AllocKind::Shm | AllocKind::Mmap => {
                // SAFETY: base/len describe a live mapping we own.
                unsafe {
                    libc::munmap(self.base.cast(), self.len);
                }
            }
            AllocKind::Heap => {
                // SAFETY: allocated with this exact layout in `allocate`.
                unsafe {
                    let layout =
                        std::alloc::Layout::from_size_align_unchecked(self.len, 4096);
                    std::alloc::dealloc(self.base, layout);
                }
            }
        }
    }
}
