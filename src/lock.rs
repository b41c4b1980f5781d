//! The versioned slot lock: one atomic word per record packing a
//! monotonically increasing version counter and a 2-bit allocation state.
//!
//! Everything else in the crate is built on this word. Writers move a slot
//! through FREE → DIRTY → ALLOCATED with at most one racing CAS
//! ([`VersionedLock::free_to_dirty`], the claim); all later transitions
//! belong to the claiming owner. Readers never block writers: they snapshot
//! the word, read the record, then revalidate the word
//! (a seqlock-style optimistic read).

use std::sync::atomic::{self, AtomicU64, Ordering};

const STATE_MASK: u64 = 0b11;
const VERSION_SHIFT: u32 = 2;

const FREE: u64 = 0b00;
const DIRTY: u64 = 0b01;
const ALLOCATED: u64 = 0b10;

/// Allocation state of a slot, as carried in the low bits of the lock word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Nobody owns the record; its contents are meaningless.
    Free,
    /// Exactly one writer owns the record and may be mutating it.
    Dirty,
    /// The record is published and safe for optimistic readers.
    Allocated,
}

/// A snapshot of (version, state) taken by [`VersionedLock::begin_optimistic`].
///
/// The token is only handed out when the slot was ALLOCATED at the time of
/// the snapshot, so a successful revalidation proves every read in between
/// belonged to a single generation of the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptimisticToken {
    word: u64,
}

/// A version counter and a 2-bit state packed into one atomic word.
///
/// The version increments each time a DIRTY record is published
/// ([`VersionedLock::dirty_to_allocated`]), totally ordering the generations
/// of the slot it guards. Releasing keeps the version, so a recycled slot is
/// distinguishable from the generation a stale reader started on.
#[derive(Debug)]
pub struct VersionedLock {
    word: AtomicU64,
}

impl Default for VersionedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedLock {
    /// Creates a lock in the FREE state with version zero.
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(FREE),
        }
    }

    #[inline]
    fn state_of(word: u64) -> u64 {
        word & STATE_MASK
    }

    /// The current version counter.
    pub fn version(&self) -> u64 {
        self.word.load(Ordering::Relaxed) >> VERSION_SHIFT
    }

    /// The current allocation state.
    pub fn state(&self) -> SlotState {
        match Self::state_of(self.word.load(Ordering::Relaxed)) {
            FREE => SlotState::Free,
            DIRTY => SlotState::Dirty,
            _ => SlotState::Allocated,
        }
    }

    /// Attempts to claim a FREE slot, making it DIRTY.
    ///
    /// This is the only transition multiple writers may race for; at most
    /// one wins. Losing is harmless and expected: the caller simply tries
    /// the next candidate slot.
    ///
    /// The success ordering is `AcqRel`, so the winner's subsequent record
    /// writes cannot be reordered before the claim.
    pub fn free_to_dirty(&self) -> bool {
        let word = self.word.load(Ordering::Relaxed);

        if Self::state_of(word) != FREE {
            return false;
        }

        let dirty = (word & !STATE_MASK) | DIRTY;

        self.word
            .compare_exchange(word, dirty, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Publishes a DIRTY record, making it ALLOCATED and incrementing the
    /// version.
    ///
    /// Owner-only: the calling thread must hold the DIRTY claim, so no CAS
    /// is needed. The release store makes every record write performed while
    /// DIRTY visible to readers that observe the new word.
    pub fn dirty_to_allocated(&self) {
        let word = self.word.load(Ordering::Relaxed);
        debug_assert_eq!(Self::state_of(word), DIRTY);

        let version = word >> VERSION_SHIFT;
        let next = ((version.wrapping_add(1)) << VERSION_SHIFT) | ALLOCATED;

        self.word.store(next, Ordering::Release);
    }

    /// Takes an ALLOCATED record back to DIRTY for an in-place update.
    ///
    /// A CAS rather than an owner-only store, so exactly one concurrent
    /// caller can hold the DIRTY claim; that exclusivity is what makes
    /// [`crate::pool::Slot::modify`] safe to expose. The `AcqRel` success
    /// ordering keeps the caller's record writes after the transition.
    pub fn allocated_to_dirty(&self) -> bool {
        let word = self.word.load(Ordering::Relaxed);

        if Self::state_of(word) != ALLOCATED {
            return false;
        }

        let dirty = (word & !STATE_MASK) | DIRTY;

        self.word
            .compare_exchange(word, dirty, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases an ALLOCATED record. Owner-only. Keeps the version.
    pub fn allocated_to_free(&self) {
        let word = self.word.load(Ordering::Relaxed);
        debug_assert_eq!(Self::state_of(word), ALLOCATED);

        self.word.store(word & !STATE_MASK, Ordering::Release);
    }

    /// Abandons a DIRTY claim that was never published. Owner-only.
    ///
    /// Used when construction of the record fails after the slot was
    /// claimed; the version is kept so readers cannot confuse the aborted
    /// generation with a published one.
    pub fn dirty_to_free(&self) {
        let word = self.word.load(Ordering::Relaxed);
        debug_assert_eq!(Self::state_of(word), DIRTY);

        self.word.store(word & !STATE_MASK, Ordering::Release);
    }

    /// Whether the slot is currently FREE. A single load; scanners use this
    /// to filter candidates without taking any lock.
    pub fn is_free(&self) -> bool {
        Self::state_of(self.word.load(Ordering::Relaxed)) == FREE
    }

    /// Whether the slot is currently ALLOCATED (published and readable).
    pub fn is_populated(&self) -> bool {
        Self::state_of(self.word.load(Ordering::Acquire)) == ALLOCATED
    }

    /// Begins an optimistic read, returning a token iff the slot is
    /// currently ALLOCATED.
    ///
    /// The caller reads the record fields (with volatile loads, since a
    /// writer may be racing), then calls [`end_optimistic`] to learn whether
    /// the read overlapped a mutation or a recycle and must be discarded.
    ///
    /// [`end_optimistic`]: VersionedLock::end_optimistic
    pub fn begin_optimistic(&self) -> Option<OptimisticToken> {
        let word = self.word.load(Ordering::Acquire);

        if Self::state_of(word) == ALLOCATED {
            Some(OptimisticToken { word })
        } else {
            None
        }
    }

    /// Ends an optimistic read. Returns `true` iff no writer touched the
    /// slot since the matching [`begin_optimistic`].
    ///
    /// Any change in (version, state) — an in-place update, a release, or a
    /// full recycle to a new generation — fails the validation.
    ///
    /// [`begin_optimistic`]: VersionedLock::begin_optimistic
    pub fn end_optimistic(&self, token: OptimisticToken) -> bool {
        // The fence keeps the record reads from being reordered past the
        // validating load.
        atomic::fence(Ordering::Acquire);

        self.word.load(Ordering::Relaxed) == token.word
    }
}

#[cfg(test)]
mod tests {
    use super::{SlotState, VersionedLock};

    #[test]
    fn claim_is_exclusive() {
        let lock = VersionedLock::new();

        assert!(lock.is_free());
        assert!(lock.free_to_dirty());
        assert_eq!(lock.state(), SlotState::Dirty);

        // A second claim on the same slot loses.
        assert!(!lock.free_to_dirty());

        lock.dirty_to_allocated();
        assert!(lock.is_populated());
        assert!(!lock.free_to_dirty());
    }

    #[test]
    fn publish_bumps_version_release_keeps_it() {
        let lock = VersionedLock::new();
        assert_eq!(lock.version(), 0);

        assert!(lock.free_to_dirty());
        lock.dirty_to_allocated();
        assert_eq!(lock.version(), 1);

        lock.allocated_to_free();
        assert_eq!(lock.version(), 1);
        assert!(lock.is_free());

        assert!(lock.free_to_dirty());
        lock.dirty_to_allocated();
        assert_eq!(lock.version(), 2);
    }

    #[test]
    fn abandoned_claim_returns_to_free() {
        let lock = VersionedLock::new();

        assert!(lock.free_to_dirty());
        lock.dirty_to_free();
        assert!(lock.is_free());
        assert_eq!(lock.version(), 0);
    }

    #[test]
    fn in_place_update_invalidates_readers() {
        let lock = VersionedLock::new();
        assert!(lock.free_to_dirty());
        lock.dirty_to_allocated();

        let token = lock.begin_optimistic().unwrap();
        assert!(lock.end_optimistic(token));

        // An in-place update between begin and end is detected.
        let token = lock.begin_optimistic().unwrap();
        assert!(lock.allocated_to_dirty());
        assert!(!lock.allocated_to_dirty());
        lock.dirty_to_allocated();
        assert!(!lock.end_optimistic(token));
    }

    #[test]
    fn recycle_invalidates_readers() {
        let lock = VersionedLock::new();
        assert!(lock.free_to_dirty());
        lock.dirty_to_allocated();

        let token = lock.begin_optimistic().unwrap();

        lock.allocated_to_free();
        assert!(lock.free_to_dirty());
        lock.dirty_to_allocated();

        assert!(!lock.end_optimistic(token));
    }

    #[test]
    fn begin_requires_allocated() {
        let lock = VersionedLock::new();
        assert!(lock.begin_optimistic().is_none());

        assert!(lock.free_to_dirty());
        assert!(lock.begin_optimistic().is_none());

        lock.dirty_to_allocated();
        assert!(lock.begin_optimistic().is_some());
    }
}
