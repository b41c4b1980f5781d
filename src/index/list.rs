//! The split-ordered list: one sorted, lock-free singly-linked list shared
//! by every bucket of a hash index.
//!
//! Nodes are ordered by their bit-reversed hash (then by key bytes), so
//! splitting a bucket only requires inserting one new sentinel node at the
//! correctly-sorted position — real nodes never move. The low bit of a
//! node's next-pointer doubles as the logical-deletion mark; traversal
//! helps unlink marked nodes and hands them to the caller's purgatory.
//!
//! Traversal keeps three rolling pins (next, curr, prev) published and
//! revalidates the predecessor link after each pin, so reclamation can
//! never pull a node out from under a reader mid-dereference.

use std::{
    mem::MaybeUninit,
    ptr,
    slice,
    sync::atomic::Ordering,
};

use tagptr::{AtomicTagPtr, TagPtr};

use crate::reclaim::{Pins, Reclaimable};

pub(crate) const PIN_NEXT: usize = 0;
pub(crate) const PIN_CURR: usize = 1;
pub(crate) const PIN_PREV: usize = 2;

/// Next-pointer tag marking a logically-deleted node.
const DELETED: usize = 1;

/// One list node: either a data node (order key LSB 1, real key bytes and
/// payload) or a bucket sentinel (order key LSB 0, empty key, no payload).
///
/// The link word is reused as the free-stack link while the node is dead;
/// a stale reader that loads it sees an untagged pointer into the free
/// stack and fails its predecessor revalidation.
pub(crate) struct Node<T> {
    link: AtomicTagPtr<Node<T>, 1>,
    order: u32,
    key: Box<[u8]>,
    value: MaybeUninit<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            link: AtomicTagPtr::null(),
            order: 0,
            key: Box::default(),
            value: MaybeUninit::uninit(),
        }
    }
}

impl<T> Node<T> {
    fn is_data(&self) -> bool {
        self.order & 1 == 1
    }

    /// Initializes a fresh or recycled node as a data node.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive logical ownership of `node` (just
    /// allocated, not yet published) and `node` must be scrubbed.
    pub(crate) unsafe fn init_data(node: *mut Self, order: u32, key: &[u8], value: T) {
        debug_assert_eq!(order & 1, 1);

        // A recycled node's link still points into the free stack.
        (*node).link.store(TagPtr::null(), Ordering::SeqCst);
        ptr::addr_of_mut!((*node).order).write(order);
        let key_field = ptr::addr_of_mut!((*node).key);
        key_field.read(); // drop the scrubbed (empty) key box
        key_field.write(key.to_vec().into_boxed_slice());
        ptr::addr_of_mut!((*node).value).write(MaybeUninit::new(value));
    }

    /// Initializes a fresh or recycled node as a bucket sentinel.
    ///
    /// # Safety
    ///
    /// Same contract as [`Node::init_data`].
    pub(crate) unsafe fn init_sentinel(node: *mut Self, order: u32) {
        debug_assert_eq!(order & 1, 0);

        (*node).link.store(TagPtr::null(), Ordering::SeqCst);
        ptr::addr_of_mut!((*node).order).write(order);
    }

    /// # Safety
    ///
    /// `node` must be a data node that is pinned (or otherwise known
    /// live) for the duration of the borrow.
    pub(crate) unsafe fn value_ref<'v>(node: *mut Self) -> &'v T {
        debug_assert!((*node).is_data());

        &*ptr::addr_of!((*node).value).cast::<T>()
    }

    /// # Safety
    ///
    /// As [`Node::value_ref`]; the key slice detaches from the node
    /// borrow, so the caller bounds its use by the pin.
    unsafe fn key_ref<'k>(node: *mut Self) -> &'k [u8] {
        let key = &*ptr::addr_of!((*node).key);
        slice::from_raw_parts(key.as_ptr(), key.len())
    }

    pub(crate) unsafe fn order_of(node: *mut Self) -> u32 {
        (*node).order
    }

    pub(crate) fn next_of(&self) -> *mut Self {
        self.link.load(Ordering::SeqCst).decompose_ptr()
    }
}

impl<T> Reclaimable for Node<T> {
    fn next_free(&self) -> *mut Self {
        self.link.load(Ordering::SeqCst).decompose_ptr()
    }

    fn set_next_free(&self, next: *mut Self) {
        self.link.store(TagPtr::compose(next, 0), Ordering::SeqCst);
    }

    unsafe fn scrub(node: *mut Self) {
        if (*node).is_data() {
            ptr::drop_in_place(ptr::addr_of_mut!((*node).value).cast::<T>());
            ptr::addr_of_mut!((*node).order).write(0);
        }

        let key_field = ptr::addr_of_mut!((*node).key);
        let old = key_field.read();
        key_field.write(Box::default());
        drop(old);
    }
}

/// A bucket-directory cell: null until the bucket's sentinel is
/// materialized, then a stable untagged pointer to it.
pub(crate) struct BucketCell<T>(pub(crate) AtomicTagPtr<Node<T>, 1>);

impl<T> Default for BucketCell<T> {
    fn default() -> Self {
        Self(AtomicTagPtr::null())
    }
}

/// Position returned by [`search`]: `prev` is the link (bucket cell or
/// predecessor node) that pointed at `curr` when the position was
/// validated; `curr` and `prev` are pinned.
pub(crate) struct Position<T> {
    pub(crate) prev: *const AtomicTagPtr<Node<T>, 1>,
    pub(crate) curr: *mut Node<T>,
}

pub(crate) enum InsertOutcome<T> {
    Inserted,
    /// An equal, live node already exists (and is pinned as CURR).
    Found(*mut Node<T>),
    /// The retry budget ran out under contention.
    Spent,
}

/// Finds the first position whose (order, key) is >= the target, helping
/// to unlink any logically-deleted node encountered on the way.
///
/// Returns whether an equal live node was found. On return the position's
/// nodes are pinned; the caller unpins when done.
pub(crate) fn search<T>(
    head: &AtomicTagPtr<Node<T>, 1>,
    order: u32,
    key: &[u8],
    pins: &mut Pins<'_, Node<T>>,
) -> (bool, Position<T>) {
    'restart: loop {
        let mut prev: *const AtomicTagPtr<Node<T>, 1> = head;
        let mut curr = unsafe { (*prev).load(Ordering::SeqCst) }.decompose_ptr();

        loop {
            if curr.is_null() {
                return (false, Position { prev, curr });
            }

            pins.pin(PIN_CURR, curr);
            if unsafe { (*prev).load(Ordering::SeqCst) } != TagPtr::compose(curr, 0) {
                continue 'restart;
            }

            let link = unsafe { (*curr).link.load(Ordering::SeqCst) };
            let (next, tag) = link.decompose();
            pins.pin(PIN_NEXT, next);
            if unsafe { (*curr).link.load(Ordering::SeqCst) } != link {
                continue 'restart;
            }

            if tag == DELETED {
                // Help finish the pending deletion, then take its place.
                let unlinked = unsafe { &*prev }
                    .compare_exchange(
                        TagPtr::compose(curr, 0),
                        TagPtr::compose(next, 0),
                        (Ordering::SeqCst, Ordering::SeqCst),
                    )
                    .is_ok();
                if !unlinked {
                    continue 'restart;
                }

                pins.free(curr);
                curr = next;
                continue;
            }

            let curr_order = unsafe { Node::order_of(curr) };
            let curr_key = unsafe { Node::key_ref(curr) };

            if curr_order > order || (curr_order == order && curr_key >= key) {
                let found = curr_order == order && curr_key == key;
                return (found, Position { prev, curr });
            }

            pins.pin(PIN_PREV, curr);
            prev = unsafe { ptr::addr_of!((*curr).link) };
            curr = next;
        }
    }
}

/// Inserts a fully-initialized, unpublished node at its sorted position
/// with a single CAS on the predecessor link.
///
/// With `unique`, an equal live node aborts the insert; the node stays
/// the caller's to dispose of.
pub(crate) fn insert<T>(
    head: &AtomicTagPtr<Node<T>, 1>,
    node: *mut Node<T>,
    unique: bool,
    pins: &mut Pins<'_, Node<T>>,
    retries: usize,
) -> InsertOutcome<T> {
    let order = unsafe { Node::order_of(node) };
    let key = unsafe { Node::key_ref(node) };

    for _ in 0..retries {
        let (found, position) = search(head, order, key, pins);

        if found && unique {
            return InsertOutcome::Found(position.curr);
        }

        unsafe {
            (*node)
                .link
                .store(TagPtr::compose(position.curr, 0), Ordering::SeqCst);
        }

        if unsafe { &*position.prev }
            .compare_exchange(
                TagPtr::compose(position.curr, 0),
                TagPtr::compose(node, 0),
                (Ordering::SeqCst, Ordering::SeqCst),
            )
            .is_ok()
        {
            return InsertOutcome::Inserted;
        }
    }

    InsertOutcome::Spent
}

/// Logically deletes the first live node equal to (order, key) by tagging
/// its link, then attempts the physical unlink. The unlinked node goes to
/// the caller's purgatory (here, or in whichever traversal helps first).
pub(crate) fn delete<T>(
    head: &AtomicTagPtr<Node<T>, 1>,
    order: u32,
    key: &[u8],
    pins: &mut Pins<'_, Node<T>>,
) -> bool {
    loop {
        let (found, position) = search(head, order, key, pins);
        if !found {
            return false;
        }
        let curr = position.curr;

        let link = unsafe { (*curr).link.load(Ordering::SeqCst) };
        let (next, tag) = link.decompose();
        if tag == DELETED {
            // A concurrent deleter won the mark; let search help out and
            // report whatever is left.
            continue;
        }

        // The mark is the linearization point: it blocks a concurrent
        // inserter from hooking a new node behind a dying one.
        if unsafe { &*curr }
            .link
            .compare_exchange(
                link,
                TagPtr::compose(next, DELETED),
                (Ordering::SeqCst, Ordering::SeqCst),
            )
            .is_err()
        {
            continue;
        }

        if unsafe { &*position.prev }
            .compare_exchange(
                TagPtr::compose(curr, 0),
                TagPtr::compose(next, 0),
                (Ordering::SeqCst, Ordering::SeqCst),
            )
            .is_ok()
        {
            pins.free(curr);
        } else {
            // Lost the unlink race; a fresh traversal completes it.
            search(head, order, key, pins);
        }

        return true;
    }
}

/// Walks live data nodes in split order starting at `head`, stopping
/// before any node whose order key reaches `stop_before`. Returns a clone
/// of the first payload `pred` accepts.
pub(crate) fn scan<T: Clone>(
    head: &AtomicTagPtr<Node<T>, 1>,
    stop_before: Option<u32>,
    pred: &mut dyn FnMut(&T) -> bool,
    pins: &mut Pins<'_, Node<T>>,
) -> Option<T> {
    'restart: loop {
        let mut prev: *const AtomicTagPtr<Node<T>, 1> = head;
        let mut curr = unsafe { (*prev).load(Ordering::SeqCst) }.decompose_ptr();

        loop {
            if curr.is_null() {
                return None;
            }

            pins.pin(PIN_CURR, curr);
            if unsafe { (*prev).load(Ordering::SeqCst) } != TagPtr::compose(curr, 0) {
                continue 'restart;
            }

            let link = unsafe { (*curr).link.load(Ordering::SeqCst) };
            let (next, tag) = link.decompose();
            pins.pin(PIN_NEXT, next);
            if unsafe { (*curr).link.load(Ordering::SeqCst) } != link {
                continue 'restart;
            }

            if tag == DELETED {
                let unlinked = unsafe { &*prev }
                    .compare_exchange(
                        TagPtr::compose(curr, 0),
                        TagPtr::compose(next, 0),
                        (Ordering::SeqCst, Ordering::SeqCst),
                    )
                    .is_ok();
                if !unlinked {
                    continue 'restart;
                }

                pins.free(curr);
                curr = next;
                continue;
            }

            let curr_order = unsafe { Node::order_of(curr) };
            if let Some(limit) = stop_before {
                if curr_order >= limit {
                    return None;
                }
            }

            if curr_order & 1 == 1 {
                let value = unsafe { Node::value_ref(curr) };
                if pred(value) {
                    return Some(value.clone());
                }
            }

            pins.pin(PIN_PREV, curr);
            prev = unsafe { ptr::addr_of!((*curr).link) };
            curr = next;
        }
    }
}
