//! A lock-free extensible hash index over byte-string keys.
//!
//! All nodes live on a single split-ordered list; the bucket directory is
//! an array of shortcut pointers into it, kept on a [`GrowArray`] so cells
//! never move when the directory doubles. Growing the index is a single
//! CAS on the bucket count, and each new bucket's sentinel is materialized
//! lazily by the first operation that needs it.
//!
//! Every operation takes a [`Pins`] handle checked out from the index.
//! Readers publish the node addresses they are about to dereference;
//! deleters park unlinked nodes in the handle's purgatory until no pin
//! matches, then recycle them through a type-stable free stack. Node
//! memory is only handed back to the allocator when the index is dropped.

mod list;

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hasher},
    sync::atomic::{AtomicU32, Ordering},
};

use tagptr::{AtomicTagPtr, TagPtr};

use crate::{
    grow_array::GrowArray,
    reclaim::{Pins as RawPins, Reclaimable, Reclaimer},
};

use list::{BucketCell, InsertOutcome, Node};

/// Hard ceiling on the bucket directory, well inside the growable array's
/// address space.
const MAX_BUCKET_COUNT: u32 = 1 << 24;

/// Full-restart attempts before an insert gives up under contention.
const INSERT_RETRIES: usize = 128;

/// Outcome of [`HashIndex::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// A unique index already held an equal key; the new value was
    /// discarded.
    Duplicate,
    /// The retry budget ran out; the caller may retry from scratch.
    Exhausted,
}

/// A thread's checked-out pin set for one index.
///
/// Dropping it flushes any nodes the thread unlinked and returns the pin
/// set for reuse. Cheap enough to check out per batch of operations, but
/// not per operation.
pub struct Pins<'a, T>(RawPins<'a, Node<T>>);

pub struct HashIndex<T, S = RandomState> {
    buckets: GrowArray<BucketCell<T>>,
    reclaimer: Reclaimer<Node<T>>,
    /// Current bucket count; always a power of two.
    size: AtomicU32,
    /// Live data nodes.
    count: AtomicU32,
    unique: bool,
    build_hasher: S,
}

impl<T: Clone> HashIndex<T, RandomState> {
    /// Creates an empty index. With `unique`, inserting an existing key
    /// reports [`InsertResult::Duplicate`] instead of adding a second
    /// node.
    pub fn new(unique: bool) -> Self {
        Self::with_hasher(unique, RandomState::new())
    }
}

impl<T: Clone, S: BuildHasher> HashIndex<T, S> {
    pub fn with_hasher(unique: bool, build_hasher: S) -> Self {
        Self {
            buckets: GrowArray::new(),
            reclaimer: Reclaimer::new(),
            size: AtomicU32::new(1),
            count: AtomicU32::new(0),
            unique,
            build_hasher,
        }
    }

    /// Checks out a pin set for the calling thread.
    pub fn pins(&self) -> Pins<'_, T> {
        Pins(self.reclaimer.pins())
    }

    /// Inserts `value` under `key`. The value is copied into a node that
    /// becomes visible to all threads with a single CAS.
    pub fn insert(&self, pins: &mut Pins<'_, T>, key: &[u8], value: T) -> InsertResult {
        let hash = self.hash_key(key);
        let order = hash.reverse_bits() | 1;

        let node = self.reclaimer.allocate(&pins.0);
        unsafe { Node::init_data(node, order, key, value) };

        let size = self.size.load(Ordering::SeqCst);
        let head = match self.bucket_head(hash & (size - 1), &mut pins.0) {
            Some(head) => head,
            None => {
                pins.0.free(node);
                return InsertResult::Exhausted;
            }
        };

        let outcome = list::insert(head, node, self.unique, &mut pins.0, INSERT_RETRIES);
        pins.0.unpin_all();

        match outcome {
            InsertOutcome::Inserted => {
                let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                self.maybe_grow(count);
                InsertResult::Inserted
            }
            InsertOutcome::Found(_) => {
                // Never published, but a racing free-stack pop may hold
                // this address pinned; dispose through purgatory.
                pins.0.free(node);
                InsertResult::Duplicate
            }
            InsertOutcome::Spent => {
                pins.0.free(node);
                InsertResult::Exhausted
            }
        }
    }

    /// Looks `key` up and returns a clone of its value.
    ///
    /// The clone happens under the pin, so the caller holds an owned
    /// snapshot that outlives any concurrent delete of the node.
    pub fn search(&self, pins: &mut Pins<'_, T>, key: &[u8]) -> Option<T> {
        let hash = self.hash_key(key);
        let order = hash.reverse_bits() | 1;

        let size = self.size.load(Ordering::SeqCst);
        let head = self.bucket_head(hash & (size - 1), &mut pins.0)?;

        let (found, position) = list::search(head, order, key, &mut pins.0);
        let result = if found {
            Some(unsafe { Node::value_ref(position.curr) }.clone())
        } else {
            None
        };

        pins.0.unpin_all();
        result
    }

    /// Deletes the first node holding `key`. Returns whether a node was
    /// deleted.
    pub fn delete(&self, pins: &mut Pins<'_, T>, key: &[u8]) -> bool {
        let hash = self.hash_key(key);
        let order = hash.reverse_bits() | 1;

        let size = self.size.load(Ordering::SeqCst);
        let head = match self.bucket_head(hash & (size - 1), &mut pins.0) {
            Some(head) => head,
            None => return false,
        };

        let removed = list::delete(head, order, key, &mut pins.0);
        if removed {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }

        pins.0.unpin_all();
        removed
    }

    /// Returns a clone of some value accepted by `pred`, scanning from a
    /// seed-derived start bucket and wrapping around, so repeated calls
    /// with varying seeds spread over the whole index.
    pub fn random_match(
        &self,
        pins: &mut Pins<'_, T>,
        seed: u64,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<T> {
        let size = self.size.load(Ordering::SeqCst);
        let start = ((seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40) as u32) & (size - 1);

        let result = (|| {
            let head = self.bucket_head(start, &mut pins.0)?;
            if let Some(value) = list::scan(head, None, &mut pred, &mut pins.0) {
                return Some(value);
            }

            if start != 0 {
                // Wrap: everything sorted before the start bucket's
                // sentinel.
                let head = self.bucket_head(0, &mut pins.0)?;
                let stop = start.reverse_bits();
                return list::scan(head, Some(stop), &mut pred, &mut pins.0);
            }

            None
        })();

        pins.0.unpin_all();
        result
    }

    /// Visits a clone-free snapshot of every live value, in split order.
    /// Concurrent inserts and deletes may or may not be observed.
    pub fn for_each(&self, pins: &mut Pins<'_, T>, mut f: impl FnMut(&T)) {
        if let Some(head) = self.bucket_head(0, &mut pins.0) {
            let mut visit = |value: &T| {
                f(value);
                false
            };
            list::scan(head, None, &mut visit, &mut pins.0);
        }

        pins.0.unpin_all();
    }

    fn hash_key(&self, key: &[u8]) -> u32 {
        let mut hasher = self.build_hasher.build_hasher();
        hasher.write(key);
        hasher.finish() as u32
    }

    /// Doubles the directory once the load factor reaches one. Only the
    /// count CAS grows; new buckets stay unmaterialized until touched.
    fn maybe_grow(&self, count: u32) {
        let size = self.size.load(Ordering::SeqCst);
        if count > size
            && size < MAX_BUCKET_COUNT
            && self
                .size
                .compare_exchange(size, size * 2, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            #[cfg(feature = "logging")]
            log::trace!("vitals: hash index grew to {} buckets", size * 2);
        }
    }

    /// Returns bucket `bucket`'s sentinel link, materializing the sentinel
    /// (and, recursively, its parent's) on first touch.
    fn bucket_head(
        &self,
        bucket: u32,
        pins: &mut RawPins<'_, Node<T>>,
    ) -> Option<&AtomicTagPtr<Node<T>, 1>> {
        let cell = self.buckets.get_or_alloc(bucket as usize)?;
        if !cell.0.load(Ordering::SeqCst).decompose_ptr().is_null() {
            return Some(&cell.0);
        }

        let sentinel = self.reclaimer.allocate(&*pins);
        unsafe { Node::init_sentinel(sentinel, bucket.reverse_bits()) };

        if bucket == 0 {
            // First node of the whole list.
            if cell
                .0
                .compare_exchange(
                    TagPtr::null(),
                    TagPtr::compose(sentinel, 0),
                    (Ordering::SeqCst, Ordering::SeqCst),
                )
                .is_err()
            {
                pins.free(sentinel);
            }
            return Some(&cell.0);
        }

        // The parent bucket covers this one until the sentinel splits it:
        // its index is ours with the highest set bit cleared.
        let parent = bucket & !(1 << (31 - bucket.leading_zeros()));
        let parent_head = self.bucket_head(parent, pins)?;

        let published = match list::insert(parent_head, sentinel, true, pins, INSERT_RETRIES) {
            InsertOutcome::Inserted => sentinel,
            InsertOutcome::Found(existing) => {
                pins.free(sentinel);
                existing
            }
            InsertOutcome::Spent => {
                pins.unpin_all();
                pins.free(sentinel);
                return None;
            }
        };

        // Racing threads publish the same sentinel; a failed CAS means it
        // is already in place.
        let _ = cell.0.compare_exchange(
            TagPtr::null(),
            TagPtr::compose(published, 0),
            (Ordering::SeqCst, Ordering::SeqCst),
        );

        Some(&cell.0)
    }
}

impl<T, S> HashIndex<T, S> {
    /// Live entries. Concurrent operations make this a point-in-time
    /// approximation.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current directory size.
    pub fn bucket_count(&self) -> usize {
        self.size.load(Ordering::SeqCst) as usize
    }

    /// Bytes of node memory obtained from the allocator (recycled nodes
    /// included).
    pub fn memory_used(&self) -> usize {
        self.reclaimer.memory_used()
    }
}

impl<T, S> Drop for HashIndex<T, S> {
    fn drop(&mut self) {
        // Exclusive access: free every node still on the list. Nodes that
        // went through purgatory are on the free stack and are released by
        // the reclaimer's own drop.
        if let Some(cell) = self.buckets.get(0) {
            let mut node = cell.0.load(Ordering::SeqCst).decompose_ptr();
            while !node.is_null() {
                let next = unsafe { &*node }.next_of();
                unsafe {
                    <Node<T> as Reclaimable>::scrub(node);
                    drop(Box::from_raw(node));
                }
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{HashIndex, InsertResult};

    #[test]
    fn insert_search_delete() {
        let index: HashIndex<u64> = HashIndex::new(true);
        let mut pins = index.pins();

        assert_eq!(index.insert(&mut pins, b"alpha", 1), InsertResult::Inserted);
        assert_eq!(index.insert(&mut pins, b"beta", 2), InsertResult::Inserted);
        assert_eq!(index.len(), 2);

        assert_eq!(index.search(&mut pins, b"alpha"), Some(1));
        assert_eq!(index.search(&mut pins, b"beta"), Some(2));
        assert_eq!(index.search(&mut pins, b"gamma"), None);

        assert!(index.delete(&mut pins, b"alpha"));
        assert!(!index.delete(&mut pins, b"alpha"));
        assert_eq!(index.search(&mut pins, b"alpha"), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let index: HashIndex<u64> = HashIndex::new(true);
        let mut pins = index.pins();

        assert_eq!(index.insert(&mut pins, b"key", 1), InsertResult::Inserted);
        assert_eq!(index.insert(&mut pins, b"key", 2), InsertResult::Duplicate);
        assert_eq!(index.search(&mut pins, b"key"), Some(1));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn non_unique_index_keeps_both() {
        let index: HashIndex<u64> = HashIndex::new(false);
        let mut pins = index.pins();

        assert_eq!(index.insert(&mut pins, b"key", 1), InsertResult::Inserted);
        assert_eq!(index.insert(&mut pins, b"key", 2), InsertResult::Inserted);
        assert_eq!(index.len(), 2);

        // Delete removes one node per call.
        assert!(index.delete(&mut pins, b"key"));
        assert!(index.search(&mut pins, b"key").is_some());
        assert!(index.delete(&mut pins, b"key"));
        assert_eq!(index.search(&mut pins, b"key"), None);
    }

    #[test]
    fn directory_doubles_as_entries_accumulate() {
        let index: HashIndex<usize> = HashIndex::new(true);
        let mut pins = index.pins();

        assert_eq!(index.bucket_count(), 1);
        for i in 0..64usize {
            let key = format!("session-{i:03}");
            assert_eq!(
                index.insert(&mut pins, key.as_bytes(), i),
                InsertResult::Inserted
            );
        }
        assert!(index.bucket_count() >= 64);

        // Everything stays findable across the splits.
        for i in 0..64usize {
            let key = format!("session-{i:03}");
            assert_eq!(index.search(&mut pins, key.as_bytes()), Some(i));
        }
    }

    #[test]
    fn for_each_sees_exactly_the_live_values() {
        let index: HashIndex<u32> = HashIndex::new(true);
        let mut pins = index.pins();

        index.insert(&mut pins, b"a", 1);
        index.insert(&mut pins, b"b", 2);
        index.insert(&mut pins, b"c", 3);
        index.delete(&mut pins, b"b");

        assert_eq!(index.search(&mut pins, b"a"), Some(1));
        assert_eq!(index.search(&mut pins, b"b"), None);
        assert_eq!(index.search(&mut pins, b"c"), Some(3));

        let mut seen = Vec::new();
        index.for_each(&mut pins, |v| seen.push(*v));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn random_match_wraps_the_whole_index() {
        let index: HashIndex<u32> = HashIndex::new(true);
        let mut pins = index.pins();

        for i in 0..32u32 {
            index.insert(&mut pins, &i.to_le_bytes(), i);
        }

        // Whatever the seed lands on, a match-all predicate must find
        // something, and a specific predicate must find its value.
        for seed in 0..16u64 {
            assert!(index.random_match(&mut pins, seed, |_| true).is_some());
            assert_eq!(index.random_match(&mut pins, seed, |v| *v == 17), Some(17));
        }
        assert_eq!(index.random_match(&mut pins, 3, |_| false), None);
    }

    #[test]
    fn values_are_cloned_out_under_the_pin() {
        let index: HashIndex<String> = HashIndex::new(true);
        let mut pins = index.pins();

        index.insert(&mut pins, b"k", String::from("payload"));
        let copy = index.search(&mut pins, b"k").unwrap();

        // The snapshot stays valid after the node dies.
        assert!(index.delete(&mut pins, b"k"));
        assert_eq!(copy, "payload");
    }
}
