//! The scalable slab pool: a bounded set of lazily-materialized pages of
//! versioned slots.
//!
//! `allocate` scans the materialized pages round-robin from a monotonic
//! counter and claims the first free slot with a single CAS. Only when every
//! existing page is physically full does a thread take the short
//! page-creation mutex, re-check, and materialize one new page
//! (construct-then-publish, so a partially-built page is never visible).
//! When the configured capacity is exhausted the pool marks itself full,
//! bumps a saturating lost counter and returns nothing — a purely local,
//! non-fatal failure the instrumentation call site degrades around.
//!
//! The per-page and per-pool "full" flags are advisory fast-path hints:
//! `allocate` re-verifies physically before reporting a loss, so a stale
//! flag can only cost a wasted scan, never a wrong outcome.

mod partitioned;

pub use partitioned::PartitionedPool;

use std::{
    cell::UnsafeCell,
    mem,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::{
    error::ConfigError,
    lock::VersionedLock,
};

/// Default slots per page; pools smaller than this get a single page.
pub const DEFAULT_PAGE_LEN: usize = 1024;

/// How many times a torn optimistic read is retried before the sample is
/// dropped.
const OPTIMISTIC_SPINS: usize = 8;

/// One fixed-size record slot inside a page.
///
/// The slot owns its [`VersionedLock`] and carries integer back-references
/// (partition, page, flat index) to its owners, so release and flat
/// addressing are O(1) without raw back-pointers.
pub struct Slot<T> {
    lock: VersionedLock,
    partition: u32,
    page: u32,
    index: u32,
    value: UnsafeCell<T>,
}

// Readers only touch `value` through validated volatile copies (`read`) and
// mutation is serialized by the DIRTY claim, so sharing a slot is safe
// whenever the record itself can move between threads.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// The slot's versioned lock, for callers that drive the optimistic
    /// read protocol by hand.
    pub fn lock(&self) -> &VersionedLock {
        &self.lock
    }

    /// Flat index of this slot within its pool.
    pub fn local_index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn partition(&self) -> u32 {
        self.partition
    }

    /// Whether the record is currently published.
    pub fn is_populated(&self) -> bool {
        self.lock.is_populated()
    }

    /// Updates the record in place. Returns `false` (without running `f`)
    /// if the slot is not ALLOCATED or another updater holds the claim.
    ///
    /// Concurrent optimistic readers are invalidated, not blocked: their
    /// end-of-read validation fails and they retry or drop the sample.
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> bool {
        if !self.lock.allocated_to_dirty() {
            return false;
        }

        f(unsafe { &mut *self.value.get() });
        self.lock.dirty_to_allocated();

        true
    }
}

impl<T: Copy> Slot<T> {
    /// Takes a validated optimistic snapshot of the record.
    ///
    /// Returns `None` when the slot is not populated, or when every retry
    /// overlapped a mutation or recycle. A returned value is guaranteed to
    /// belong to a single generation of the record: (version, state) was
    /// ALLOCATED and unchanged across the whole copy.
    pub fn read(&self) -> Option<T> {
        for _ in 0..OPTIMISTIC_SPINS {
            let token = self.lock.begin_optimistic()?;

            // Volatile: a writer may be racing; the token validation below
            // decides whether the copy was torn.
            let value = unsafe { ptr::read_volatile(self.value.get()) };

            if self.lock.end_optimistic(token) {
                return Some(value);
            }
        }

        None
    }
}

/// A freshly-claimed DIRTY slot, not yet visible to readers.
///
/// Fill the record through [`value_mut`], then [`publish`] it. Dropping the
/// writer instead abandons the claim and returns the slot to FREE.
///
/// [`value_mut`]: SlotWriter::value_mut
/// [`publish`]: SlotWriter::publish
pub struct SlotWriter<'a, T> {
    slot: &'a Slot<T>,
}

impl<'a, T> SlotWriter<'a, T> {
    /// Exclusive access to the record; the DIRTY claim is the exclusion.
    pub fn value_mut(&mut self) -> &mut T {
        unsafe { &mut *self.slot.value.get() }
    }

    /// Flat index the slot will have once published.
    pub fn local_index(&self) -> usize {
        self.slot.local_index()
    }

    /// Publishes the record, making it ALLOCATED and safe for readers.
    pub fn publish(self) -> &'a Slot<T> {
        let slot = self.slot;
        mem::forget(self);

        slot.lock.dirty_to_allocated();
        slot
    }
}

impl<T> Drop for SlotWriter<'_, T> {
    fn drop(&mut self) {
        self.slot.lock.dirty_to_free();
    }
}

struct Page<T> {
    base: usize,
    slots: Box<[Slot<T>]>,
    monotonic: CachePadded<AtomicUsize>,
    full: AtomicBool,
}

impl<T: Default> Page<T> {
    fn new(index: u32, partition: u32, base: usize, len: usize) -> Self {
        let slots = (0..len)
            .map(|i| Slot {
                lock: VersionedLock::new(),
                partition,
                page: index,
                index: (base + i) as u32,
                value: UnsafeCell::new(T::default()),
            })
            .collect();

        Self {
            base,
            slots,
            monotonic: CachePadded::new(AtomicUsize::new(0)),
            full: AtomicBool::new(false),
        }
    }
}

impl<T> Page<T> {
    /// Attempts to claim one free slot, scanning round-robin from this
    /// page's own monotonic counter.
    fn try_claim(&self) -> Option<&Slot<T>> {
        let len = self.slots.len();
        let start = self.monotonic.fetch_add(1, Ordering::Relaxed) % len;

        for i in 0..len {
            let slot = &self.slots[(start + i) % len];
            if slot.lock.is_free() && slot.lock.free_to_dirty() {
                return Some(slot);
            }
        }

        None
    }
}

/// A bounded, lazily-growing slab pool of versioned slots.
///
/// The count of simultaneously ALLOCATED slots never exceeds the configured
/// capacity. Pages are created at most once each and never destroyed before
/// the pool itself; a `&Slot` therefore stays valid for the pool's
/// lifetime.
pub struct Pool<T> {
    pages: Box<[AtomicPtr<Page<T>>]>,
    page_len: usize,
    capacity: usize,
    partition: u32,
    page_count: AtomicUsize,
    monotonic: CachePadded<AtomicUsize>,
    full: AtomicBool,
    lost: CachePadded<AtomicUsize>,
    create_lock: Mutex<()>,
}

unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T: Default> Pool<T> {
    /// Creates a pool of `capacity` slots with the default page length.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Self::with_page_len(capacity, DEFAULT_PAGE_LEN.min(capacity.max(1)))
    }

    /// Creates a pool of `capacity` slots split into pages of `page_len`
    /// (the last page may be shorter).
    pub fn with_page_len(capacity: usize, page_len: usize) -> Result<Self, ConfigError> {
        Self::new_partitioned(capacity, page_len, 0)
    }

    pub(crate) fn new_partitioned(
        capacity: usize,
        page_len: usize,
        partition: u32,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if page_len == 0 {
            return Err(ConfigError::ZeroPageLength);
        }

        let max_pages = (capacity + page_len - 1) / page_len;
        let pages = (0..max_pages)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Ok(Self {
            pages,
            page_len,
            capacity,
            partition,
            page_count: AtomicUsize::new(0),
            monotonic: CachePadded::new(AtomicUsize::new(0)),
            full: AtomicBool::new(false),
            lost: CachePadded::new(AtomicUsize::new(0)),
            create_lock: Mutex::new(()),
        })
    }

    /// Claims a slot, returning it DIRTY for the caller to fill and
    /// publish. Returns `None` only when the pool's configured capacity is
    /// exhausted, after a physical re-scan; the lost counter records the
    /// failure.
    pub fn allocate(&self) -> Option<SlotWriter<'_, T>> {
        loop {
            let page_count = self.page_count.load(Ordering::Acquire);

            if page_count > 0 {
                let start = self.monotonic.fetch_add(1, Ordering::Relaxed) % page_count;

                for i in 0..page_count {
                    let page = unsafe { &*self.pages[(start + i) % page_count].load(Ordering::Acquire) };

                    if page.full.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Some(slot) = page.try_claim() {
                        return Some(SlotWriter { slot });
                    }

                    // Advisory; the next deallocation on this page clears it.
                    page.full.store(true, Ordering::Relaxed);
                }
            }

            if page_count >= self.pages.len() {
                // Max page count reached. The full flags are only hints, so
                // re-verify physically before reporting a loss.
                for i in 0..page_count {
                    let page = unsafe { &*self.pages[i].load(Ordering::Acquire) };
                    if let Some(slot) = page.try_claim() {
                        return Some(SlotWriter { slot });
                    }
                }

                if !self.full.swap(true, Ordering::Relaxed) {
                    #[cfg(feature = "logging")]
                    log::debug!(
                        "vitals: pool partition {} exhausted at {} slots",
                        self.partition,
                        self.capacity
                    );
                }
                self.lost
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        Some(n.saturating_add(1))
                    })
                    .ok();

                return None;
            }

            // Every materialized page is full: materialize one more. The
            // double check under the mutex makes at most one thread build
            // the page; the others observe and reuse it.
            let guard = self.create_lock.lock();
            if self.page_count.load(Ordering::Acquire) == page_count {
                let base = page_count * self.page_len;
                let len = self.page_len.min(self.capacity - base);
                let page = Box::new(Page::new(page_count as u32, self.partition, base, len));

                self.pages[page_count].store(Box::into_raw(page), Ordering::Release);
                self.page_count.store(page_count + 1, Ordering::Release);

                #[cfg(feature = "logging")]
                log::debug!(
                    "vitals: pool partition {} materialized page {} ({} slots)",
                    self.partition,
                    page_count,
                    len
                );
            }
            drop(guard);
        }
    }

    /// Releases a published slot back to the pool. O(1) through the slot's
    /// own back-references; clears the advisory full flags.
    pub fn deallocate(&self, slot: &Slot<T>) {
        debug_assert!(self
            .sanitize(slot as *const Slot<T>)
            .is_some());

        slot.lock.allocated_to_free();

        let page = unsafe { &*self.pages[slot.page as usize].load(Ordering::Acquire) };
        page.full.store(false, Ordering::Relaxed);
        self.full.store(false, Ordering::Relaxed);
    }
}

impl<T> Pool<T> {
    /// Slots addressable right now (materialized pages only).
    pub fn materialized_len(&self) -> usize {
        let page_count = self.page_count.load(Ordering::Acquire);
        (page_count * self.page_len).min(self.capacity)
    }

    /// Returns the slot at `index`, if its page has been materialized. The
    /// slot may be in any state; readers filter with [`Slot::is_populated`]
    /// or a validated [`Slot::read`].
    pub fn get(&self, index: usize) -> Option<&Slot<T>> {
        if index >= self.materialized_len() {
            return None;
        }

        let page = unsafe { &*self.pages[index / self.page_len].load(Ordering::Acquire) };
        page.slots.get(index - page.base)
    }

    /// Like [`get`], also reporting whether any slot beyond `index` exists,
    /// so scanners know when to stop.
    ///
    /// [`get`]: Pool::get
    pub fn get_with_hint(&self, index: usize) -> (Option<&Slot<T>>, bool) {
        (self.get(index), index + 1 < self.materialized_len())
    }

    /// A restartable cursor over populated slots, starting at flat index 0.
    ///
    /// Pages materialized after the scan began may or may not be visited.
    pub fn iter(&self) -> Iter<'_, T> {
        self.iter_from(0)
    }

    /// A cursor over populated slots resuming at `index`.
    pub fn iter_from(&self, index: usize) -> Iter<'_, T> {
        Iter { pool: self, index }
    }

    /// Visits every populated slot.
    pub fn apply(&self, mut f: impl FnMut(&Slot<T>)) {
        self.each_page(|page| {
            for slot in page.slots.iter() {
                if slot.lock.is_populated() {
                    f(slot);
                }
            }
        });
    }

    /// Visits every slot, free ones included. Used for bulk resets.
    pub fn apply_all(&self, mut f: impl FnMut(&Slot<T>)) {
        self.each_page(|page| {
            for slot in page.slots.iter() {
                f(slot);
            }
        });
    }

    fn each_page(&self, mut f: impl FnMut(&Page<T>)) {
        let page_count = self.page_count.load(Ordering::Acquire);
        for i in 0..page_count {
            f(unsafe { &*self.pages[i].load(Ordering::Acquire) });
        }
    }

    /// Validates a retained raw address against the pool's backing storage.
    ///
    /// Returns the pointer as a live reference iff it lies inside a
    /// materialized page and is slot-aligned; `None` otherwise. Consumers
    /// that stored a slot address without holding a pin (history buffers)
    /// must re-validate here before dereferencing it again.
    pub fn sanitize(&self, ptr: *const Slot<T>) -> Option<&Slot<T>> {
        let addr = ptr as usize;
        let mut found = None;

        self.each_page(|page| {
            let base = page.slots.as_ptr() as usize;
            let end = base + page.slots.len() * mem::size_of::<Slot<T>>();

            if addr >= base && addr < end && (addr - base) % mem::size_of::<Slot<T>>() == 0 {
                found = Some(unsafe { &*ptr });
            }
        });

        found
    }

    /// The configured capacity, which the presentation layer sizes rows
    /// against.
    pub fn row_count(&self) -> usize {
        self.capacity
    }

    /// Count of currently published slots.
    pub fn populated_count(&self) -> usize {
        let mut n = 0;
        self.apply(|_| n += 1);
        n
    }

    /// Bytes of backing storage materialized so far.
    pub fn memory_used(&self) -> usize {
        let mut bytes = self.pages.len() * mem::size_of::<AtomicPtr<Page<T>>>();
        self.each_page(|page| {
            bytes += mem::size_of::<Page<T>>() + page.slots.len() * mem::size_of::<Slot<T>>();
        });
        bytes
    }

    /// Allocations refused for lack of capacity (saturating).
    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }

    /// Advisory: whether the last exhaustion flag is still set.
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let page_count = *self.page_count.get_mut();
        for i in 0..page_count {
            let page = *self.pages[i].get_mut();
            drop(unsafe { Box::from_raw(page) });
        }
    }
}

/// Stateful cursor over a pool's populated slots. See [`Pool::iter`].
pub struct Iter<'a, T> {
    pool: &'a Pool<T>,
    index: usize,
}

impl<'a, T> Iter<'a, T> {
    /// The flat index the next scan step starts from; feed it back to
    /// [`Pool::iter_from`] to resume a suspended scan.
    pub fn position(&self) -> usize {
        self.index
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Slot<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (slot, has_more) = self.pool.get_with_hint(self.index);
            let slot = slot?;
            self.index += 1;

            if slot.is_populated() {
                return Some(slot);
            }
            if !has_more {
                return None;
            }
        }
    }
}
