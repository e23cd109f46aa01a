//! The fine-grain page queue: one mutex per slot, linear-congruential
//! search order.
//!
//! The container is an array that never reorders; "take" means finding a
//! random slot whose descriptor satisfies the predicate and locking it,
//! "put" means storing the descriptor back and unlocking. A plain
//! sequential retry would bias pages at the start of a run of candidates,
//! so the search walks a full-period linear congruential permutation of the
//! slot indices instead, with a random phase per search: the design
//! requirement is that a single matching slot is always found, while no
//! slot is systematically preferred.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::PageEntry;
use crate::queue::PageKind;
use crate::telemetry::Step;
use crate::{Error, Result};

// 64-bit LCG constants for the seed slots.
const RAND_MUL: u64 = 2_862_933_555_777_941_757;
const RAND_INC: u64 = 3_037_000_493;

// Slot metadata word: a lock-free mirror of the predicate-relevant fields,
// so the search can pre-filter without taking the slot lock. The lock
// remains the sole authority; a stale hit is caught by the re-check.
const META_SEEDED: u64 = 1 << 33;
const META_VALID: u64 = 1 << 32;

fn encode_meta(valid: bool, tag: u32) -> u64 {
    META_SEEDED | (u64::from(valid) << 32) | u64::from(tag)
}

fn meta_matches(meta: u64, kind: PageKind, tag: Option<u32>) -> bool {
    if meta & META_SEEDED == 0 {
        return false;
    }
    let valid = meta & META_VALID != 0;
    if (kind == PageKind::Valid) != valid {
        return false;
    }
    match tag {
        None => true,
        Some(mask) => (meta as u32) & mask != 0,
    }
}

struct Slot {
    entry: Mutex<PageEntry>,
    meta: AtomicU64,
}

/// A locked queue slot, handed to the worker that took it.
///
/// The slot mutex stays held for the lifetime of the handle, so the
/// descriptor behind it cannot be observed or taken by anyone else until a
/// `put_*` call releases it.
pub struct SlotHandle<'q> {
    guard: MutexGuard<'q, PageEntry>,
    slot: &'q Slot,
}

impl std::ops::Deref for SlotHandle<'_> {
    type Target = PageEntry;
    fn deref(&self) -> &PageEntry {
        &self.guard
    }
}

impl std::ops::DerefMut for SlotHandle<'_> {
    fn deref_mut(&mut self) -> &mut PageEntry {
        &mut self.guard
    }
}

/// Build the LCG multiplier for modulus `m`: a value where `a - 1` is
/// divisible by every prime factor of `m` (and by 4 when `m` is), which by
/// Hull-Dobell gives the generator full period.
fn lcg_multiplier(m: u64) -> u64 {
    let mut remaining = m;
    let mut a: u64 = if m % 4 == 0 { 2 } else { 1 };
    let mut i = 2;
    while i <= remaining {
        if remaining % i == 0 {
            while remaining % i == 0 {
                remaining /= i;
            }
            a *= i;
        }
        i += 1;
    }
    (a + 1) % m
}

/// Largest prime at most `3m/4 + 1`, the LCG increment. One is prime
/// enough when nothing larger exists.
fn lcg_increment(m: u64) -> u64 {
    let start = (3 * m) / 4 + 1;
    let mut candidate = start;
    while candidate > 1 {
        let mut is_prime = true;
        let mut i = 2;
        while i * i <= candidate {
            if candidate % i == 0 {
                is_prime = false;
                break;
            }
            i += 1;
        }
        if is_prime {
            return candidate;
        }
        candidate -= 1;
    }
    1
}

/// Pick `(a, c, m)` for queue size `len`. When `len` itself only admits the
/// trivial multiplier, grow the modulus until a nontrivial one appears;
/// out-of-range values are discarded during the walk.
fn lcg_params(len: u64) -> (u64, u64, u64) {
    if len < 3 {
        return (1, 1, len.max(1));
    }
    let mut m = len;
    let mut a = lcg_multiplier(m);
    while a == 1 {
        m += 1;
        a = lcg_multiplier(m);
    }
    (a, lcg_increment(m), m)
}

/// The per-slot-locked page container.
pub struct FineLockQueue {
    slots: Vec<Slot>,
    page_size: u64,
    lcg_a: u64,
    lcg_c: u64,
    lcg_m: u64,
    rand_seeds: [Mutex<u64>; 4],
}

impl FineLockQueue {
    /// Create a queue of `size` unseeded slots for pages of `page_size`
    /// bytes. Slots match no predicate until seeded.
    #[must_use]
    pub fn new(size: u64, page_size: u64) -> Self {
        let slots = (0..size)
            .map(|_| Slot {
                entry: Mutex::new(PageEntry::default()),
                meta: AtomicU64::new(0),
            })
            .collect();
        let (lcg_a, lcg_c, lcg_m) = lcg_params(size);
        Self {
            slots,
            page_size,
            lcg_a,
            lcg_c,
            lcg_m,
            rand_seeds: [
                Mutex::new(0xbeef),
                Mutex::new(0xbef0),
                Mutex::new(0xbef1),
                Mutex::new(0xbef2),
            ],
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the queue has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert the initial descriptor for slot `index`. Initialization only;
    /// the slot becomes takeable (as empty) afterwards.
    ///
    /// # Errors
    ///
    /// Fails when `index` is out of range.
    pub fn seed(&self, index: usize, mut pe: PageEntry) -> Result<()> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| Error::QueueCorrupt(format!("seed index {index} out of range")))?;
        pe.pattern = None;
        let tag = pe.tag;
        *slot.entry.lock() = pe;
        slot.meta.store(encode_meta(false, tag), Ordering::Release);
        Ok(())
    }

    /// Draw from one of four independent generators, taking whichever seed
    /// slot is uncontended.
    pub(crate) fn random64(&self) -> u64 {
        for seed in &self.rand_seeds {
            if let Some(mut guard) = seed.try_lock() {
                *guard = guard.wrapping_mul(RAND_MUL).wrapping_add(RAND_INC);
                return *guard;
            }
        }
        // All four busy: just wait on the first.
        let mut guard = self.rand_seeds[0].lock();
        *guard = guard.wrapping_mul(RAND_MUL).wrapping_add(RAND_INC);
        *guard
    }

    fn advance(&self, next: u64) -> u64 {
        ((u128::from(self.lcg_a) * u128::from(next) + u128::from(self.lcg_c))
            % u128::from(self.lcg_m)) as u64
    }

    /// Find, lock and return a slot matching `kind` (and `tag` when given).
    ///
    /// # Errors
    ///
    /// [`Error::NoPageAvailable`] when a full search cycle finds no match.
    pub fn take(&self, kind: PageKind, tag: Option<u32>, step: &Step) -> Result<SlotHandle<'_>> {
        let n = self.slots.len() as u64;
        if n == 0 {
            return Err(Error::QueueCorrupt("take on zero-size queue".to_string()));
        }

        let first = self.random64() % n;
        let mut next: u64 = 1;

        for _ in 0..n {
            let index = ((next + first) % n) as usize;
            next = self.advance(next);
            while next >= n {
                // Modulus larger than the queue: discard out-of-range
                // values.
                next = self.advance(next);
            }

            let slot = &self.slots[index];
            // Cheap pre-filter on the mirror word; the lock is expensive.
            if !meta_matches(slot.meta.load(Ordering::Relaxed), kind, tag) {
                continue;
            }

            let Some(mut guard) = slot.entry.try_lock() else {
                continue;
            };
            // The state can change between the dirty read and the lock.
            let holds = match kind {
                PageKind::Valid => guard.is_valid(),
                PageKind::Empty => guard.is_empty(),
            };
            let tag_holds = tag.map_or(true, |mask| guard.tag & mask != 0);
            if !holds || !tag_holds {
                continue;
            }

            if kind == PageKind::Valid {
                guard.touch += 1;
            }
            return Ok(SlotHandle { guard, slot });
        }

        step.debug(format!("page search exhausted for {kind:?} tag {tag:?}"));
        Err(Error::NoPageAvailable(kind))
    }

    /// Return a held slot as empty, discarding any pattern still attached.
    pub fn put_empty(&self, mut handle: SlotHandle<'_>) {
        handle.guard.pattern = None;
        let tag = handle.guard.tag;
        handle.slot.meta.store(encode_meta(false, tag), Ordering::Release);
    }

    /// Return a held slot as valid.
    ///
    /// # Errors
    ///
    /// Fails (releasing the slot as empty) when the descriptor carries no
    /// pattern.
    pub fn put_valid(&self, mut handle: SlotHandle<'_>) -> Result<()> {
        if handle.guard.pattern.is_none() {
            let tag = handle.guard.tag;
            handle.slot.meta.store(encode_meta(false, tag), Ordering::Release);
            return Err(Error::QueueCorrupt(
                "put_valid on a page with no pattern".to_string(),
            ));
        }
        let tag = handle.guard.tag;
        handle.slot.meta.store(encode_meta(true, tag), Ordering::Release);
        Ok(())
    }

    /// Emit a log2-bucket histogram of per-page read counts.
    pub fn analyze(&self, step: &Step) {
        let mut buckets = [0u64; 32];
        for slot in &self.slots {
            let touch = slot.entry.lock().touch;
            let mut b = 0;
            while b < 31 {
                if u64::from(touch) < (1 << b) {
                    break;
                }
                b += 1;
            }
            buckets[b] += 1;
        }

        let mut series = step.series("Queue Analysis: Reads per page", "pages");
        for count in buckets.into_iter().filter(|&c| c != 0) {
            series.add_element(count as f64);
        }
    }

    /// Find the slot whose physical mapping covers `paddr`. Linear scan;
    /// assumes linearly mapped pages.
    #[must_use]
    pub fn page_for_paddr(&self, paddr: u64) -> Option<PageEntry> {
        for slot in &self.slots {
            let entry = slot.entry.lock();
            if entry.paddr != 0 && entry.paddr <= paddr && paddr < entry.paddr + self.page_size {
                return Some(entry.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::INVALID_TAG;
    use std::sync::Arc;

    fn seeded_queue(n: u64) -> FineLockQueue {
        let q = FineLockQueue::new(n, 4096);
        for i in 0..n {
            q.seed(i as usize, PageEntry::new(i * 4096)).unwrap();
        }
        q
    }

    fn step() -> Step {
        Step::new("queue test")
    }

    // ------------------------------------------------------------------
    // LCG construction
    // ------------------------------------------------------------------

    fn is_prime(n: u64) -> bool {
        n > 1 && (2..n).take_while(|i| i * i <= n).all(|i| n % i != 0)
    }

    #[test]
    fn test_lcg_multiplier_divisibility() {
        // a - 1 must be divisible by every prime factor of m.
        for m in [4u64, 12, 36, 64, 100, 4096, 12288] {
            let a = lcg_multiplier(m);
            if a <= 1 {
                continue;
            }
            let mut rem = m;
            let mut p = 2;
            while p <= rem {
                if rem % p == 0 {
                    assert_eq!((a - 1) % p, 0, "m={m} a={a} prime={p}");
                    while rem % p == 0 {
                        rem /= p;
                    }
                }
                p += 1;
            }
            if m % 4 == 0 {
                assert_eq!((a - 1) % 4, 0, "m={m} a={a}");
            }
        }
    }

    #[test]
    fn test_lcg_increment_is_prime_near_three_quarters() {
        for m in [8u64, 64, 100, 1000, 4096] {
            let c = lcg_increment(m);
            assert!(is_prime(c) || c == 1);
            assert!(c <= (3 * m) / 4 + 1);
        }
    }

    #[test]
    fn test_lcg_walk_is_a_permutation() {
        for n in [1u64, 2, 3, 5, 7, 16, 64, 100, 257] {
            let (a, c, m) = lcg_params(n);
            let mut seen = vec![false; n as usize];
            let mut next: u64 = 1;
            let first = 0;
            for _ in 0..n {
                let idx = ((next + first) % n) as usize;
                next = (a * next + c) % m;
                while next >= n {
                    next = (a * next + c) % m;
                }
                seen[idx] = true;
            }
            assert!(seen.iter().all(|&s| s), "n={n} a={a} c={c} m={m}");
        }
    }

    // ------------------------------------------------------------------
    // Take / put semantics
    // ------------------------------------------------------------------

    #[test]
    fn test_take_empty_then_put_valid_roundtrip() {
        let patterns = crate::pattern::PatternList::new().unwrap();
        let q = seeded_queue(8);
        let s = step();

        let mut handle = q.take(PageKind::Empty, None, &s).unwrap();
        handle.pattern = Some(patterns.random_pattern());
        q.put_valid(handle).unwrap();

        let handle = q.take(PageKind::Valid, None, &s).unwrap();
        assert!(handle.is_valid());
        assert_eq!(handle.touch, 1);
        q.put_empty(handle);

        // Back to all-empty: no valid page remains.
        assert!(q.take(PageKind::Valid, None, &s).is_err());
    }

    #[test]
    fn test_put_valid_without_pattern_fails() {
        let q = seeded_queue(4);
        let s = step();
        let handle = q.take(PageKind::Empty, None, &s).unwrap();
        assert!(q.put_valid(handle).is_err());
        // Slot released as empty, still takeable.
        assert!(q.take(PageKind::Empty, None, &s).is_ok());
    }

    #[test]
    fn test_single_matching_slot_is_found_at_every_position() {
        let patterns = crate::pattern::PatternList::new().unwrap();
        let n = 64u64;
        for target in [0, 1, n - 1, n / 2] {
            let q = seeded_queue(n);
            let s = step();
            // Make exactly one page valid, at a chosen offset.
            loop {
                let mut handle = q.take(PageKind::Empty, None, &s).unwrap();
                let offset = handle.offset;
                if offset == target * 4096 {
                    handle.pattern = Some(patterns.random_pattern());
                    q.put_valid(handle).unwrap();
                    break;
                }
                q.put_empty(handle);
            }
            let found = q.take(PageKind::Valid, None, &s).unwrap();
            assert_eq!(found.offset, target * 4096);
        }
    }

    #[test]
    fn test_tag_filter() {
        let patterns = crate::pattern::PatternList::new().unwrap();
        let q = seeded_queue(8);
        let s = step();

        // Tag every page into region 0 except one into region 1.
        for _ in 0..8 {
            let mut handle = q.take(PageKind::Empty, Some(INVALID_TAG), &s).unwrap();
            handle.tag = if handle.offset == 0 { 1 << 1 } else { 1 << 0 };
            handle.pattern = Some(patterns.random_pattern());
            q.put_valid(handle).unwrap();
        }

        let region1 = q.take(PageKind::Valid, Some(1 << 1), &s).unwrap();
        assert_eq!(region1.offset, 0);
        q.put_empty(region1);

        assert!(q.take(PageKind::Valid, Some(1 << 1), &s).is_err());
        assert!(q.take(PageKind::Valid, Some(1 << 0), &s).is_ok());
    }

    #[test]
    fn test_exclusive_ownership_under_contention() {
        let patterns = Arc::new(crate::pattern::PatternList::new().unwrap());
        let q = Arc::new(seeded_queue(16));

        // Fill everything.
        {
            let s = step();
            for _ in 0..16 {
                let mut h = q.take(PageKind::Empty, None, &s).unwrap();
                h.pattern = Some(patterns.random_pattern());
                q.put_valid(h).unwrap();
            }
        }

        let hits = Arc::new(AtomicU64::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let hits = Arc::clone(&hits);
            threads.push(std::thread::spawn(move || {
                let s = Step::new("contention");
                for _ in 0..500 {
                    if let Ok(mut h) = q.take(PageKind::Valid, None, &s) {
                        // While held, we are the only writer of this slot.
                        let before = h.last_cpu;
                        h.last_cpu = before.wrapping_add(1);
                        hits.fetch_add(1, Ordering::Relaxed);
                        q.put_valid(h).unwrap();
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        // Every successful take incremented exactly one slot once; the sum
        // of slot counters equals the number of successful takes.
        let s = step();
        let mut total = 0u64;
        for _ in 0..16 {
            let h = q.take(PageKind::Valid, None, &s).unwrap();
            total += u64::from(h.last_cpu);
            q.put_empty(h);
        }
        assert_eq!(total, hits.load(Ordering::Relaxed));
    }

    #[test]
    fn test_page_for_paddr() {
        let q = seeded_queue(4);
        let s = step();
        // Assign a physical address to one page.
        loop {
            let mut h = q.take(PageKind::Empty, None, &s).unwrap();
            if h.offset == 2 * 4096 {
                h.paddr = 0x10_0000;
                q.put_empty(h);
                break;
            }
            q.put_empty(h);
        }
        let found = q.page_for_paddr(0x10_0800).unwrap();
        assert_eq!(found.offset, 2 * 4096);
        assert!(q.page_for_paddr(0x20_0000).is_none());
    }

    #[test]
    fn test_unseeded_slots_match_nothing() {
        let q = FineLockQueue::new(8, 4096);
        let s = step();
        assert!(q.take(PageKind::Empty, None, &s).is_err());
        assert!(q.take(PageKind::Valid, None, &s).is_err());
    }

    #[test]
    fn test_random64_advances() {
        let q = seeded_queue(2);
        let a = q.random64();
        let b = q.random64();
        assert_ne!(a, b);
    }
}
