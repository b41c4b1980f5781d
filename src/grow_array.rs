//! A lock-free, append-only, multi-level array of fixed-size blocks.
//!
//! Elements are addressed by a flat index and materialized lazily: the
//! first access of an index allocates the 256-entry leaf block (and any
//! missing pointer blocks above it) with a construct-then-publish CAS, the
//! loser freeing its copy and adopting the winner's. Existing elements are
//! never moved or copied on growth, so a `&T` obtained from the array stays
//! valid for the array's lifetime and readers never race with a resize.
//!
//! Level `k` holds a pointer tree of depth `k` whose leaves are value
//! blocks; four levels cover 256 + 256² + 256³ + 256⁴ entries, which is
//! more than any registry this crate hosts can address.

use std::{
    marker::PhantomData,
    ptr,
    slice,
    sync::atomic::{AtomicPtr, Ordering},
};

pub(crate) const LEVEL_LEN: usize = 256;
pub(crate) const NUM_LEVELS: usize = 4;

pub(crate) struct GrowArray<T> {
    levels: [AtomicPtr<u8>; NUM_LEVELS],
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for GrowArray<T> {}
unsafe impl<T: Send + Sync> Sync for GrowArray<T> {}

fn alloc_branch() -> *mut u8 {
    let block: Box<[AtomicPtr<u8>]> = (0..LEVEL_LEN)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect();

    Box::into_raw(block) as *mut u8
}

/// # Safety
///
/// `p` must have been returned by [`alloc_branch`].
unsafe fn free_branch(p: *mut u8) {
    drop(Box::from_raw(slice::from_raw_parts_mut(
        p.cast::<AtomicPtr<u8>>(),
        LEVEL_LEN,
    )));
}

fn alloc_leaf<T: Default>() -> *mut u8 {
    let block: Box<[T]> = (0..LEVEL_LEN).map(|_| T::default()).collect();

    Box::into_raw(block) as *mut u8
}

/// # Safety
///
/// `p` must have been returned by [`alloc_leaf::<T>`] with the same `T`.
unsafe fn free_leaf<T>(p: *mut u8) {
    drop(Box::from_raw(slice::from_raw_parts_mut(
        p.cast::<T>(),
        LEVEL_LEN,
    )));
}

/// Loads the block behind `cell`, installing a fresh one if the cell is
/// still null. The block is fully built before the CAS makes it visible; a
/// losing thread frees its copy and adopts the winner's.
fn load_or_install<M, F>(cell: &AtomicPtr<u8>, make: M, free: F) -> *mut u8
where
    M: FnOnce() -> *mut u8,
    F: FnOnce(*mut u8),
{
    let p = cell.load(Ordering::Acquire);
    if !p.is_null() {
        return p;
    }

    let fresh = make();
    match cell.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fresh,
        Err(winner) => {
            free(fresh);
            winner
        }
    }
}

impl<T> GrowArray<T> {
    pub(crate) const fn new() -> Self {
        Self {
            levels: [
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
            ],
            _marker: PhantomData,
        }
    }

    /// Splits a flat index into (level, offset within that level).
    /// Returns `None` when the index exceeds what four levels can address.
    fn locate(index: usize) -> Option<(usize, usize)> {
        let mut start = 0usize;
        let mut span = LEVEL_LEN;

        for level in 0..NUM_LEVELS {
            if index < start + span {
                return Some((level, index - start));
            }
            start += span;
            span *= LEVEL_LEN;
        }

        None
    }

    /// Returns the element at `index` if its leaf block has been
    /// materialized. Never allocates.
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        let (level, within) = Self::locate(index)?;

        unsafe {
            let mut block = self.levels[level].load(Ordering::Acquire);
            for hop in 0..level {
                if block.is_null() {
                    return None;
                }
                let digit = (within >> (8 * (level - hop))) & (LEVEL_LEN - 1);
                block = (*block.cast::<AtomicPtr<u8>>().add(digit)).load(Ordering::Acquire);
            }
            if block.is_null() {
                return None;
            }

            Some(&*block.cast::<T>().add(within & (LEVEL_LEN - 1)))
        }
    }
}

impl<T: Default> GrowArray<T> {
    /// Returns the element at `index`, materializing the path of blocks
    /// leading to it as needed. Returns `None` only when `index` is beyond
    /// the addressable range.
    pub(crate) fn get_or_alloc(&self, index: usize) -> Option<&T> {
        let (level, within) = Self::locate(index)?;

        unsafe {
            let mut cell = &self.levels[level];
            for hop in 0..level {
                let block = load_or_install(cell, alloc_branch, |p| free_branch(p));
                let digit = (within >> (8 * (level - hop))) & (LEVEL_LEN - 1);
                cell = &*block.cast::<AtomicPtr<u8>>().add(digit);
            }
            let leaf = load_or_install(cell, alloc_leaf::<T>, |p| free_leaf::<T>(p));

            Some(&*leaf.cast::<T>().add(within & (LEVEL_LEN - 1)))
        }
    }
}

impl<T> Drop for GrowArray<T> {
    fn drop(&mut self) {
        /// # Safety
        ///
        /// `block` must be a branch tree of exactly `depth` pointer levels
        /// above `T` leaves, as built by `get_or_alloc`.
        unsafe fn drop_tree<T>(block: *mut u8, depth: usize) {
            if block.is_null() {
                return;
            }
            if depth == 0 {
                free_leaf::<T>(block);
                return;
            }

            for i in 0..LEVEL_LEN {
                let child = (*block.cast::<AtomicPtr<u8>>().add(i)).load(Ordering::Relaxed);
                drop_tree::<T>(child, depth - 1);
            }
            free_branch(block);
        }

        for (level, root) in self.levels.iter().enumerate() {
            unsafe { drop_tree::<T>(root.load(Ordering::Relaxed), level) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GrowArray, LEVEL_LEN};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn locate_level_boundaries() {
        assert_eq!(GrowArray::<usize>::locate(0), Some((0, 0)));
        assert_eq!(GrowArray::<usize>::locate(LEVEL_LEN - 1), Some((0, LEVEL_LEN - 1)));
        assert_eq!(GrowArray::<usize>::locate(LEVEL_LEN), Some((1, 0)));
        assert_eq!(
            GrowArray::<usize>::locate(LEVEL_LEN + LEVEL_LEN * LEVEL_LEN),
            Some((2, 0))
        );
    }

    #[test]
    fn get_does_not_materialize() {
        let array: GrowArray<AtomicUsize> = GrowArray::new();

        assert!(array.get(0).is_none());
        assert!(array.get(100_000).is_none());

        array.get_or_alloc(0).unwrap().store(7, Ordering::Relaxed);
        assert_eq!(array.get(0).unwrap().load(Ordering::Relaxed), 7);

        // A different leaf is still unmaterialized.
        assert!(array.get(LEVEL_LEN).is_none());
    }

    #[test]
    fn elements_never_move() {
        let array: GrowArray<AtomicUsize> = GrowArray::new();

        let first = array.get_or_alloc(5).unwrap() as *const AtomicUsize;

        // Growing into deeper levels must not relocate existing entries.
        for i in (0..100_000).step_by(977) {
            array.get_or_alloc(i).unwrap();
        }

        assert_eq!(array.get(5).unwrap() as *const AtomicUsize, first);
    }

    #[test]
    fn deep_indexes_round_trip() {
        let array: GrowArray<AtomicUsize> = GrowArray::new();

        let indexes = [
            0,
            255,
            256,
            511,
            65_000,
            LEVEL_LEN + LEVEL_LEN * LEVEL_LEN + 12_345,
        ];

        for &i in &indexes {
            array.get_or_alloc(i).unwrap().store(i, Ordering::Relaxed);
        }
        for &i in &indexes {
            assert_eq!(array.get(i).unwrap().load(Ordering::Relaxed), i);
        }
    }

    #[test]
    fn concurrent_materialization_converges() {
        let array: Arc<GrowArray<AtomicUsize>> = Arc::new(GrowArray::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let array = Arc::clone(&array);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        array.get_or_alloc(i).unwrap().fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        for i in 0..2_000 {
            assert_eq!(array.get(i).unwrap().load(Ordering::Relaxed), 8);
        }
    }
}
