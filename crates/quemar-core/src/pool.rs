//! The engine-level page pool: queue flavor selection plus arena mapping.
//!
//! Workers never see the queues or the arena directly; a take maps the
//! page in and stamps the access, a put unmaps it and parks the descriptor
//! back in its queue. The lease type keeps the fine-grain slot lock alive
//! for exactly the scope the worker holds the page.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::os::TestMem;
use crate::page::PageEntry;
use crate::queue::{CoarseQueue, FineLockQueue, PageKind, SlotHandle};
use crate::telemetry::Step;
use crate::{Error, Result};

enum Flavor {
    Fine(FineLockQueue),
    Coarse {
        valid: CoarseQueue,
        empty: CoarseQueue,
    },
}

/// An exclusively held page, mapped and ready for access.
pub struct PageLease<'a> {
    inner: LeaseInner<'a>,
}

enum LeaseInner<'a> {
    Fine(SlotHandle<'a>),
    Coarse(PageEntry),
}

impl std::ops::Deref for PageLease<'_> {
    type Target = PageEntry;
    fn deref(&self) -> &PageEntry {
        match &self.inner {
            LeaseInner::Fine(handle) => handle,
            LeaseInner::Coarse(pe) => pe,
        }
    }
}

impl std::ops::DerefMut for PageLease<'_> {
    fn deref_mut(&mut self) -> &mut PageEntry {
        match &mut self.inner {
            LeaseInner::Fine(handle) => handle,
            LeaseInner::Coarse(pe) => pe,
        }
    }
}

impl PageLease<'_> {
    /// The page content as 64-bit words.
    pub fn words_mut(&mut self, page_len: usize) -> &mut [u64] {
        // SAFETY: the lease maps the page (vaddr set by take) and holds
        // its slot exclusively until put.
        unsafe { self.words_unchecked(page_len) }
    }

    pub(crate) unsafe fn words_unchecked<'s>(&self, page_len: usize) -> &'s mut [u64] {
        match &self.inner {
            LeaseInner::Fine(handle) => handle.words_mut(page_len),
            LeaseInner::Coarse(pe) => pe.words_mut(page_len),
        }
    }

    /// The page content as 32-bit words.
    pub fn half_words_mut(&mut self, page_len: usize) -> &mut [u32] {
        // SAFETY: as in `words_mut`.
        unsafe {
            match &self.inner {
                LeaseInner::Fine(handle) => handle.half_words_mut(page_len),
                LeaseInner::Coarse(pe) => pe.half_words_mut(page_len),
            }
        }
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

/// Shared page pool: queue flavor + arena.
pub struct PagePool {
    flavor: Flavor,
    mem: Arc<TestMem>,
    page_len: u64,
}

impl PagePool {
    /// A fine-grain pool of `pages` slots over `mem`.
    #[must_use]
    pub fn fine(pages: u64, page_len: u64, mem: Arc<TestMem>) -> Self {
        Self {
            flavor: Flavor::Fine(FineLockQueue::new(pages, page_len)),
            mem,
            page_len,
        }
    }

    /// A coarse-grain pool (one valid ring, one empty ring) over `mem`.
    #[must_use]
    pub fn coarse(pages: u64, page_len: u64, mem: Arc<TestMem>) -> Self {
        Self {
            flavor: Flavor::Coarse {
                valid: CoarseQueue::new(pages),
                empty: CoarseQueue::new(pages),
            },
            mem,
            page_len,
        }
    }

    /// Per-page length in bytes.
    #[must_use]
    pub fn page_len(&self) -> usize {
        self.page_len as usize
    }

    /// Park the initial descriptor for page `index`. Initialization only.
    ///
    /// # Errors
    ///
    /// Fails on out-of-range indices (fine) or a full ring (coarse).
    pub fn seed(&self, index: usize, pe: PageEntry) -> Result<()> {
        match &self.flavor {
            Flavor::Fine(q) => q.seed(index, pe),
            Flavor::Coarse { empty, .. } => {
                if empty.push(pe) {
                    Ok(())
                } else {
                    Err(Error::QueueCorrupt("seed push into full ring".to_string()))
                }
            }
        }
    }

    fn map(&self, lease: &mut PageLease<'_>) -> Result<()> {
        let vaddr = self.mem.prepare(lease.offset, self.page_len);
        if vaddr == 0 {
            return Err(Error::QueueCorrupt(format!(
                "page at offset {:#x} does not fit the arena",
                lease.offset
            )));
        }
        lease.vaddr = vaddr;
        Ok(())
    }

    /// Take a page carrying data, optionally filtered by region tag.
    ///
    /// # Errors
    ///
    /// [`Error::NoPageAvailable`] when the search exhausts the queue.
    pub fn take_valid(&self, tag: Option<u32>, step: &Step) -> Result<PageLease<'_>> {
        let mut lease = match &self.flavor {
            Flavor::Fine(q) => PageLease { inner: LeaseInner::Fine(q.take(PageKind::Valid, tag, step)?) },
            Flavor::Coarse { valid, .. } => {
                let mut pe = valid
                    .pop_random()
                    .ok_or(Error::NoPageAvailable(PageKind::Valid))?;
                pe.touch += 1;
                PageLease { inner: LeaseInner::Coarse(pe) }
            }
        };
        self.map(&mut lease)?;
        lease.ts_us = now_us();
        lease.last_pattern = lease.pattern.clone();
        Ok(lease)
    }

    /// Take a free page, optionally filtered by region tag.
    ///
    /// # Errors
    ///
    /// [`Error::NoPageAvailable`] when the search exhausts the queue.
    pub fn take_empty(&self, tag: Option<u32>, step: &Step) -> Result<PageLease<'_>> {
        let mut lease = match &self.flavor {
            Flavor::Fine(q) => PageLease { inner: LeaseInner::Fine(q.take(PageKind::Empty, tag, step)?) },
            Flavor::Coarse { empty, .. } => {
                let pe = empty
                    .pop_random()
                    .ok_or(Error::NoPageAvailable(PageKind::Empty))?;
                PageLease { inner: LeaseInner::Coarse(pe) }
            }
        };
        self.map(&mut lease)?;
        Ok(lease)
    }

    /// Return a page carrying data.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor has no pattern or the ring is full.
    pub fn put_valid(&self, mut lease: PageLease<'_>) -> Result<()> {
        let vaddr = lease.vaddr;
        let offset = lease.offset;
        self.mem.release(vaddr, offset, self.page_len);
        lease.vaddr = 0;
        match (&self.flavor, lease.inner) {
            (Flavor::Fine(q), LeaseInner::Fine(handle)) => q.put_valid(handle),
            (Flavor::Coarse { valid, .. }, LeaseInner::Coarse(pe)) => {
                if pe.pattern.is_none() {
                    return Err(Error::QueueCorrupt(
                        "put_valid on a page with no pattern".to_string(),
                    ));
                }
                if valid.push(pe) {
                    Ok(())
                } else {
                    Err(Error::QueueCorrupt("valid ring full".to_string()))
                }
            }
            _ => Err(Error::Internal("lease returned to a different pool".to_string())),
        }
    }

    /// Return a page as free, discarding any pattern.
    ///
    /// # Errors
    ///
    /// Fails when the ring is full (coarse flavor only).
    pub fn put_empty(&self, mut lease: PageLease<'_>) -> Result<()> {
        let vaddr = lease.vaddr;
        let offset = lease.offset;
        self.mem.release(vaddr, offset, self.page_len);
        lease.vaddr = 0;
        match (&self.flavor, lease.inner) {
            (Flavor::Fine(q), LeaseInner::Fine(handle)) => {
                q.put_empty(handle);
                Ok(())
            }
            (Flavor::Coarse { empty, .. }, LeaseInner::Coarse(mut pe)) => {
                pe.pattern = None;
                if empty.push(pe) {
                    Ok(())
                } else {
                    Err(Error::QueueCorrupt("empty ring full".to_string()))
                }
            }
            _ => Err(Error::Internal("lease returned to a different pool".to_string())),
        }
    }

    /// Emit the fine queue's touch histogram. No-op for the coarse flavor.
    pub fn analyze(&self, step: &Step) {
        if let Flavor::Fine(q) = &self.flavor {
            q.analyze(step);
        }
    }

    /// Find the page whose physical mapping covers `paddr`.
    #[must_use]
    pub fn page_for_paddr(&self, paddr: u64) -> Option<PageEntry> {
        match &self.flavor {
            Flavor::Fine(q) => q.page_for_paddr(paddr),
            Flavor::Coarse { .. } => None,
        }
    }

    /// Draw from the pool's randomness (fine flavor's generators).
    #[must_use]
    pub fn random64(&self) -> u64 {
        match &self.flavor {
            Flavor::Fine(q) => q.random64(),
            Flavor::Coarse { .. } => now_us().wrapping_mul(2_862_933_555_777_941_757),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternList;

    fn pool(pages: u64, fine: bool) -> PagePool {
        let step = Step::new("pool test");
        let page_len = 4096u64;
        let mem = Arc::new(TestMem::allocate((pages * page_len) as usize, 0, &step).unwrap());
        let pool = if fine {
            PagePool::fine(pages, page_len, mem)
        } else {
            PagePool::coarse(pages, page_len, mem)
        };
        for i in 0..pages {
            pool.seed(i as usize, PageEntry::new(i * page_len)).unwrap();
        }
        pool
    }

    #[test]
    fn test_take_maps_page_and_put_unmaps() {
        for fine in [true, false] {
            let p = pool(4, fine);
            let step = Step::new("pool test");
            let mut lease = p.take_empty(None, &step).unwrap();
            assert_ne!(lease.vaddr, 0);
            lease.words_mut(4096)[0] = 7;
            p.put_empty(lease).unwrap();
        }
    }

    #[test]
    fn test_valid_take_stamps_access() {
        let patterns = PatternList::new().unwrap();
        for fine in [true, false] {
            let p = pool(2, fine);
            let step = Step::new("pool test");

            let mut lease = p.take_empty(None, &step).unwrap();
            lease.pattern = Some(patterns.random_pattern());
            p.put_valid(lease).unwrap();

            let lease = p.take_valid(None, &step).unwrap();
            assert_eq!(lease.touch, 1);
            assert!(lease.ts_us > 0);
            assert!(lease.last_pattern.is_some());
            p.put_valid(lease).unwrap();
        }
    }

    #[test]
    fn test_empty_pool_has_no_valid_pages() {
        for fine in [true, false] {
            let p = pool(2, fine);
            let step = Step::new("pool test");
            assert!(p.take_valid(None, &step).is_err());
        }
    }

    #[test]
    fn test_put_valid_requires_pattern() {
        for fine in [true, false] {
            let p = pool(2, fine);
            let step = Step::new("pool test");
            let lease = p.take_empty(None, &step).unwrap();
            assert!(p.put_valid(lease).is_err());
        }
    }
}
