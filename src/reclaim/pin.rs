//! Pin-set storage and checkout.
//!
//! Pin sets live in a [`GrowArray`], so a checked-in set is never moved or
//! freed before teardown and scanning threads can walk every set that was
//! ever materialized. Checkout goes through a versioned lock-free stack of
//! set indexes: the version in the high half of the stack word makes the
//! pop CAS immune to ABA, and the number of live sets tracks the number of
//! concurrently active threads rather than a configured maximum.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use smallvec::SmallVec;

use crate::grow_array::GrowArray;

/// Published pin slots per set. Three are used by list traversal (next,
/// curr, prev) and one by the allocator's free-stack pop.
pub(crate) const PIN_COUNT: usize = 4;

/// Purgatory length that triggers a purge pass.
pub(crate) const PURGE_THRESHOLD: usize = 10;

/// One thread's published pins plus its intrusive free-stack link.
///
/// The pins are written by the owning thread and read by every thread that
/// purges; both sides use SeqCst, which hazard-style reclamation needs for
/// the publish-then-validate handshake.
#[derive(Default)]
pub(crate) struct PinSlots {
    pins: [AtomicUsize; PIN_COUNT],
    /// Next free set index + 1 while this set is checked in; 0 terminates.
    free_link: AtomicU32,
}

impl PinSlots {
    pub(crate) fn pin(&self, n: usize, addr: usize) {
        self.pins[n].store(addr, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self, n: usize) {
        self.pins[n].store(0, Ordering::SeqCst);
    }

    pub(crate) fn unpin_all(&self) {
        for pin in &self.pins {
            pin.store(0, Ordering::SeqCst);
        }
    }
}

pub(crate) struct Pinboard {
    sets: GrowArray<PinSlots>,
    /// Free stack of set indexes: (version << 32) | (index + 1).
    top: CachePadded<AtomicU64>,
    /// Number of materialized sets; only ever grows.
    len: AtomicU32,
}

const INDEX_MASK: u64 = u32::MAX as u64;

impl Pinboard {
    pub(crate) fn new() -> Self {
        Self {
            sets: GrowArray::new(),
            top: CachePadded::new(AtomicU64::new(0)),
            len: AtomicU32::new(0),
        }
    }

    /// Checks out a pin set, reusing a returned one when possible and
    /// materializing a new one otherwise.
    pub(crate) fn checkout(&self) -> (u32, &PinSlots) {
        loop {
            let top = self.top.load(Ordering::SeqCst);
            let slot = (top & INDEX_MASK) as u32;

            if slot == 0 {
                // Stack empty: materialize the next set. The index counter
                // only grows, so the set stays scannable forever.
                let index = self.len.fetch_add(1, Ordering::Relaxed);
                let set = self
                    .sets
                    .get_or_alloc(index as usize)
                    .expect("pin set index space exhausted");

                #[cfg(feature = "logging")]
                log::trace!("vitals: materialized pin set {index}");

                return (index, set);
            }

            let index = slot - 1;
            let set = self
                .sets
                .get(index as usize)
                .expect("free-listed pin set must be materialized");

            let next = set.free_link.load(Ordering::SeqCst) as u64;
            let version = top >> 32;
            let new_top = (version.wrapping_add(1) << 32) | next;

            if self
                .top
                .compare_exchange(top, new_top, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return (index, set);
            }
        }
    }

    /// Returns a pin set to the free stack. The caller must have cleared
    /// its pins and emptied its purgatory.
    pub(crate) fn checkin(&self, index: u32) {
        let set = self
            .sets
            .get(index as usize)
            .expect("checked-out pin set must be materialized");

        loop {
            let top = self.top.load(Ordering::SeqCst);
            set.free_link
                .store((top & INDEX_MASK) as u32, Ordering::SeqCst);

            let version = top >> 32;
            let new_top = (version.wrapping_add(1) << 32) | u64::from(index + 1);

            if self
                .top
                .compare_exchange(top, new_top, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Collects every currently-published pin address across all sets,
    /// checked out or not. A checked-in set has all pins cleared, so
    /// scanning it merely wastes a few loads.
    pub(crate) fn collect_pins(&self, out: &mut SmallVec<[usize; 64]>) {
        let len = self.len.load(Ordering::SeqCst);

        for index in 0..len {
            if let Some(set) = self.sets.get(index as usize) {
                for pin in &set.pins {
                    let addr = pin.load(Ordering::SeqCst);
                    if addr != 0 {
                        out.push(addr);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn materialized(&self) -> u32 {
        self.len.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::Pinboard;
    use smallvec::SmallVec;

    #[test]
    fn checkout_reuses_returned_sets() {
        let board = Pinboard::new();

        let (a, _) = board.checkout();
        let (b, _) = board.checkout();
        assert_ne!(a, b);
        assert_eq!(board.materialized(), 2);

        board.checkin(a);
        let (c, _) = board.checkout();
        assert_eq!(c, a);
        assert_eq!(board.materialized(), 2);

        board.checkin(b);
        board.checkin(c);
    }

    #[test]
    fn collect_sees_published_pins() {
        let board = Pinboard::new();
        let (index, set) = board.checkout();

        set.pin(0, 0x1000);
        set.pin(2, 0x2000);

        let mut pins: SmallVec<[usize; 64]> = SmallVec::new();
        board.collect_pins(&mut pins);
        pins.sort_unstable();
        assert_eq!(pins.as_slice(), &[0x1000, 0x2000]);

        set.unpin(0);
        set.unpin(2);
        pins.clear();
        board.collect_pins(&mut pins);
        assert!(pins.is_empty());

        board.checkin(index);
    }

    #[test]
    fn checkout_tracks_concurrent_threads() {
        use std::sync::Arc;

        let board = Arc::new(Pinboard::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let board = Arc::clone(&board);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let (index, set) = board.checkout();
                        set.pin(0, index as usize + 1);
                        set.unpin(0);
                        board.checkin(index);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // Never more sets than peak concurrency.
        assert!(board.materialized() <= 4);
    }
}
