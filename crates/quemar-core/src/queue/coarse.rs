//! The coarse-grain page queue: a single-mutex ring with randomized pop.
//!
//! One physical slot beyond the capacity stays unused as a sentinel, so
//! `next_in == next_out` unambiguously means empty. `pop_random` swaps the
//! head with a uniformly chosen interior element first, which keeps the pop
//! order random without ever reordering more than two entries.

use parking_lot::Mutex;

use crate::page::PageEntry;

const RAND_MUL: u64 = 2_862_933_555_777_941_757;
const RAND_INC: u64 = 3_037_000_493;

struct Ring {
    pages: Box<[PageEntry]>,
    next_in: usize,
    next_out: usize,
    pushed: u64,
    popped: u64,
    seed: u64,
}

/// Single-mutex ring of page descriptors.
pub struct CoarseQueue {
    inner: Mutex<Ring>,
}

impl CoarseQueue {
    /// A ring holding up to `capacity` descriptors.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let size = capacity as usize + 1;
        Self {
            inner: Mutex::new(Ring {
                pages: vec![PageEntry::default(); size].into_boxed_slice(),
                next_in: 0,
                next_out: 0,
                pushed: 0,
                popped: 0,
                seed: 0xbeef,
            }),
        }
    }

    /// Insert a descriptor. Returns false (dropping nothing from the ring)
    /// when full.
    pub fn push(&self, pe: PageEntry) -> bool {
        let mut ring = self.inner.lock();
        let size = ring.pages.len();
        let next_next_in = (ring.next_in + 1) % size;
        if next_next_in == ring.next_out {
            return false;
        }
        let at = ring.next_in;
        ring.pages[at] = pe;
        ring.next_in = next_next_in;
        ring.pushed += 1;
        true
    }

    /// Remove and return a uniformly random descriptor, or `None` when
    /// empty.
    pub fn pop_random(&self) -> Option<PageEntry> {
        let mut ring = self.inner.lock();
        if ring.next_in == ring.next_out {
            return None;
        }
        ring.seed = ring.seed.wrapping_mul(RAND_MUL).wrapping_add(RAND_INC);
        let rand = ring.seed;

        let size = ring.pages.len();
        let last_in = (ring.next_in + size - 1) % size;
        let entries = (last_in + size - ring.next_out) % size;

        let out = ring.next_out;
        if entries > 0 {
            let chosen = ((rand % entries as u64) as usize + ring.next_out) % size;
            ring.pages.swap(out, chosen);
        }

        let pe = ring.pages[out].clone();
        ring.next_out = (out + 1) % size;
        ring.popped += 1;
        Some(pe)
    }

    /// Descriptors currently in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        let ring = self.inner.lock();
        let size = ring.pages.len();
        (ring.next_in + size - ring.next_out) % size
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime push counter.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.inner.lock().pushed
    }

    /// Lifetime pop counter.
    #[must_use]
    pub fn popped(&self) -> u64 {
        self.inner.lock().popped
    }
}
