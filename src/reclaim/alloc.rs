//! The reclamation allocator: purgatory purging and the type-stable free
//! stack nodes are recycled through.

use std::{
    marker::PhantomData,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use smallvec::SmallVec;

use super::pin::{PinSlots, Pinboard, PURGE_THRESHOLD};

/// Pin slot reserved for the free-stack pop.
pub(crate) const PIN_ALLOC: usize = 3;

/// A node type the reclaimer can recycle.
///
/// Implementors overlay the free-stack link on a field that is dead while
/// the node is logically removed (the hash node reuses its next-pointer
/// word). `scrub` drops owned heap content exactly once, just before the
/// node memory goes on the free stack.
pub(crate) trait Reclaimable: Default + Sized {
    fn next_free(&self) -> *mut Self;

    fn set_next_free(&self, next: *mut Self);

    /// Drops owned heap content and resets the node to its dead state.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive logical ownership of `node`: it is
    /// unlinked from every shared structure and no pin still covers it.
    unsafe fn scrub(node: *mut Self);
}

/// Owns the pin-set storage and the free stack for one node type.
///
/// Node memory is only ever handed back to the global allocator in `drop`,
/// so a thread racing with reclamation can at worst read the link word of a
/// recycled node, never a dangling mapping.
pub(crate) struct Reclaimer<T: Reclaimable> {
    pinboard: Pinboard,
    free_top: CachePadded<AtomicPtr<T>>,
    /// Total nodes ever taken from the global allocator.
    allocations: AtomicUsize,
    _marker: PhantomData<Box<T>>,
}

unsafe impl<T: Reclaimable + Send> Send for Reclaimer<T> {}
unsafe impl<T: Reclaimable + Send + Sync> Sync for Reclaimer<T> {}

impl<T: Reclaimable> Reclaimer<T> {
    pub(crate) fn new() -> Self {
        Self {
            pinboard: Pinboard::new(),
            free_top: CachePadded::new(AtomicPtr::new(std::ptr::null_mut())),
            allocations: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Checks out a pin set for the calling thread.
    pub(crate) fn pins(&self) -> Pins<'_, T> {
        let (index, slots) = self.pinboard.checkout();

        Pins {
            home: self,
            index,
            slots,
            purgatory: Vec::with_capacity(PURGE_THRESHOLD),
        }
    }

    /// Pops a recycled node, or takes a default-constructed one from the
    /// global allocator when the free stack is empty.
    ///
    /// A recycled node still carries its scrubbed previous contents; the
    /// caller must overwrite every field it reads back, the link word
    /// included. The pop pins the candidate and revalidates the top before
    /// reading its link: a node on the free stack can only have been pushed
    /// by a purge that saw no pin on it, so a pinned candidate can never be
    /// popped, reused, and re-pushed under the CAS (the ABA hazard).
    pub(crate) fn allocate(&self, pins: &Pins<'_, T>) -> *mut T {
        loop {
            let top = self.free_top.load(Ordering::SeqCst);

            if top.is_null() {
                pins.unpin(PIN_ALLOC);
                self.allocations.fetch_add(1, Ordering::Relaxed);
                return Box::into_raw(Box::new(T::default()));
            }

            pins.pin(PIN_ALLOC, top);
            if self.free_top.load(Ordering::SeqCst) != top {
                continue;
            }

            let next = unsafe { (*top).next_free() };
            if self
                .free_top
                .compare_exchange(top, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                pins.unpin(PIN_ALLOC);
                return top;
            }
        }
    }

    fn push_free(&self, node: *mut T) {
        loop {
            let top = self.free_top.load(Ordering::SeqCst);
            unsafe { (*node).set_next_free(top) };

            if self
                .free_top
                .compare_exchange(top, node, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Bytes ever obtained from the global allocator for nodes.
    pub(crate) fn memory_used(&self) -> usize {
        self.allocations.load(Ordering::Relaxed) * std::mem::size_of::<T>()
    }

    #[cfg(test)]
    pub(crate) fn free_list_contains(&self, node: *const T) -> bool {
        // Test-only, and only meaningful while no other thread is running.
        let mut p = self.free_top.load(Ordering::SeqCst);
        while !p.is_null() {
            if p as *const T == node {
                return true;
            }
            p = unsafe { (*p).next_free() };
        }
        false
    }
}

impl<T: Reclaimable> Drop for Reclaimer<T> {
    fn drop(&mut self) {
        let mut p = *self.free_top.get_mut();
        while !p.is_null() {
            let next = unsafe { (*p).next_free() };
            drop(unsafe { Box::from_raw(p) });
            p = next;
        }
    }
}

/// A checked-out pin set: the thread's published pins plus its private
/// purgatory of logically-removed nodes awaiting a grace period.
///
/// Dropping the handle flushes the purgatory (repeating the purge until
/// every entry has cleared its grace period) and returns the pin set to the
/// shared free list.
pub struct Pins<'a, T: Reclaimable> {
    home: &'a Reclaimer<T>,
    index: u32,
    slots: &'a PinSlots,
    purgatory: Vec<*mut T>,
}

unsafe impl<T: Reclaimable + Send> Send for Pins<'_, T> {}

impl<T: Reclaimable> Pins<'_, T> {
    /// Publishes `node` in pin slot `n`: "do not recycle this address".
    pub(crate) fn pin(&self, n: usize, node: *mut T) {
        self.slots.pin(n, node as usize);
    }

    pub(crate) fn unpin(&self, n: usize) {
        self.slots.unpin(n);
    }

    pub(crate) fn unpin_all(&self) {
        self.slots.unpin_all();
    }

    /// Hands a dead node to purgatory.
    ///
    /// Every disposal goes through here, never-published nodes included: a
    /// concurrent free-stack pop may have published this very address in
    /// its alloc pin between loading the stack top and revalidating it,
    /// and only the purge scan can prove that pin is gone. A direct push
    /// onto the stack would let that pop's pending CAS succeed against a
    /// recycled top (the classic ABA).
    pub(crate) fn free(&mut self, node: *mut T) {
        self.purgatory.push(node);
        if self.purgatory.len() >= PURGE_THRESHOLD {
            self.purge();
        }
    }

    /// One grace-period pass: recycle every purgatory entry no live pin
    /// matches, retain the rest for the next pass.
    pub(crate) fn purge(&mut self) {
        if self.purgatory.is_empty() {
            return;
        }

        let mut pinned: SmallVec<[usize; 64]> = SmallVec::new();
        self.home.pinboard.collect_pins(&mut pinned);
        pinned.sort_unstable();

        let home = self.home;
        self.purgatory.retain(|&node| {
            if pinned.binary_search(&(node as usize)).is_ok() {
                // Someone may be mid-dereference; try again next pass.
                true
            } else {
                unsafe { T::scrub(node) };
                home.push_free(node);
                false
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn purgatory_len(&self) -> usize {
        self.purgatory.len()
    }
}

impl<T: Reclaimable> Drop for Pins<'_, T> {
    fn drop(&mut self) {
        self.unpin_all();

        while !self.purgatory.is_empty() {
            self.purge();
            if !self.purgatory.is_empty() {
                std::thread::yield_now();
            }
        }

        self.home.pinboard.checkin(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::{Reclaimable, Reclaimer, PIN_ALLOC, PURGE_THRESHOLD};
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

    #[derive(Default)]
    struct TestNode {
        link: AtomicPtr<TestNode>,
        payload: AtomicUsize,
    }

    impl Reclaimable for TestNode {
        fn next_free(&self) -> *mut Self {
            self.link.load(Ordering::SeqCst)
        }

        fn set_next_free(&self, next: *mut Self) {
            self.link.store(next, Ordering::SeqCst);
        }

        unsafe fn scrub(node: *mut Self) {
            (*node).payload.store(0, Ordering::SeqCst);
        }
    }

    #[test]
    fn freed_nodes_are_recycled() {
        let reclaimer: Reclaimer<TestNode> = Reclaimer::new();
        let mut pins = reclaimer.pins();

        let a = reclaimer.allocate(&pins);
        pins.free(a);
        pins.purge();
        assert!(reclaimer.free_list_contains(a));

        // The next allocation pops the recycled node.
        let b = reclaimer.allocate(&pins);
        assert_eq!(a, b);
        pins.free(b);
    }

    #[test]
    fn disposal_respects_a_racing_pop_pin() {
        let reclaimer: Reclaimer<TestNode> = Reclaimer::new();
        let popper = reclaimer.pins();
        let mut owner = reclaimer.pins();

        // A free-stack pop publishes its candidate in the alloc pin before
        // revalidating the top.
        let node = reclaimer.allocate(&owner);
        popper.pin(PIN_ALLOC, node);

        // Disposing of the node (say, after losing a duplicate-insert
        // race) must not land it back on the stack while that pin lives;
        // otherwise the pop's pending CAS could succeed against a
        // recycled top.
        owner.free(node);
        owner.purge();
        assert!(!reclaimer.free_list_contains(node));

        popper.unpin(PIN_ALLOC);
        owner.purge();
        assert!(reclaimer.free_list_contains(node));
    }

    #[test]
    fn pinned_node_survives_purge() {
        let reclaimer: Reclaimer<TestNode> = Reclaimer::new();
        let reader = reclaimer.pins();
        let mut writer = reclaimer.pins();

        let node = reclaimer.allocate(&writer);
        reader.pin(1, node);

        writer.free(node);
        writer.purge();

        // The reader's pin must hold the node out of the free list.
        assert_eq!(writer.purgatory_len(), 1);
        assert!(!reclaimer.free_list_contains(node));

        reader.unpin(1);
        writer.purge();
        assert_eq!(writer.purgatory_len(), 0);
        assert!(reclaimer.free_list_contains(node));
    }

    #[test]
    fn purge_triggers_at_threshold() {
        let reclaimer: Reclaimer<TestNode> = Reclaimer::new();
        let mut pins = reclaimer.pins();

        let nodes: Vec<_> = (0..PURGE_THRESHOLD)
            .map(|_| reclaimer.allocate(&pins))
            .collect();

        for (i, &node) in nodes.iter().enumerate() {
            assert_eq!(pins.purgatory_len(), i);
            pins.free(node);
        }

        // The threshold push purged everything (nothing was pinned).
        assert_eq!(pins.purgatory_len(), 0);
        for &node in &nodes {
            assert!(reclaimer.free_list_contains(node));
        }
    }

    #[test]
    fn drop_flushes_purgatory() {
        let reclaimer: Reclaimer<TestNode> = Reclaimer::new();

        let node = {
            let mut pins = reclaimer.pins();
            let node = reclaimer.allocate(&pins);
            pins.free(node);
            node
        };

        assert!(reclaimer.free_list_contains(node));
    }
}
