//! The partitioned pool: N independent slab pools addressed as one logical
//! space.
//!
//! Callers pick a partition (typically a coarse classification of the
//! object being tracked) so page-creation mutexes and scan counters stay
//! independent under high parallelism. A flat index packs
//! (partition, local index) into the high/low bits of one `usize`;
//! releasing a slot needs no partition argument because the slot carries
//! its own back-references.

use super::{Pool, Slot, SlotWriter, DEFAULT_PAGE_LEN};
use crate::error::ConfigError;

pub struct PartitionedPool<T> {
    partitions: Box<[Pool<T>]>,
    shift: u32,
}

impl<T: Default> PartitionedPool<T> {
    /// Creates `partitions` independent pools of `per_partition` slots
    /// each.
    pub fn new(partitions: usize, per_partition: usize) -> Result<Self, ConfigError> {
        Self::with_page_len(
            partitions,
            per_partition,
            DEFAULT_PAGE_LEN.min(per_partition.max(1)),
        )
    }

    pub fn with_page_len(
        partitions: usize,
        per_partition: usize,
        page_len: usize,
    ) -> Result<Self, ConfigError> {
        if partitions == 0 {
            return Err(ConfigError::ZeroPartitions);
        }
        if per_partition == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        // Bits needed so every local index fits below the partition bits.
        let shift = if per_partition == 1 {
            0
        } else {
            usize::BITS - (per_partition - 1).leading_zeros()
        };

        let space_exhausted = shift >= usize::BITS
            || (partitions - 1)
                .checked_shl(shift)
                .map(|high| high.checked_add(per_partition - 1).is_none())
                .unwrap_or(true);
        if space_exhausted {
            return Err(ConfigError::IndexSpaceExhausted {
                partitions,
                per_partition,
            });
        }

        let pools = (0..partitions)
            .map(|p| Pool::new_partitioned(per_partition, page_len, p as u32))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();

        Ok(Self {
            partitions: pools,
            shift,
        })
    }

    /// Claims a slot from the given partition.
    ///
    /// # Panics
    ///
    /// Panics if `partition` is out of range; partition selection is the
    /// caller's classification and an invalid one is a programming error.
    pub fn allocate(&self, partition: usize) -> Option<SlotWriter<'_, T>> {
        self.partitions[partition].allocate()
    }

    /// Releases a slot. The owning partition comes from the slot itself.
    pub fn deallocate(&self, slot: &Slot<T>) {
        self.partitions[slot.partition() as usize].deallocate(slot);
    }
}

impl<T> PartitionedPool<T> {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Direct access to one partition's pool (e.g. to iterate it).
    pub fn partition(&self, partition: usize) -> &Pool<T> {
        &self.partitions[partition]
    }

    /// The flat index of a slot in the combined space.
    pub fn flat_index(&self, slot: &Slot<T>) -> usize {
        ((slot.partition() as usize) << self.shift) | slot.local_index()
    }

    /// Looks a slot up by flat index.
    pub fn get(&self, flat: usize) -> Option<&Slot<T>> {
        let partition = flat >> self.shift;
        let local = flat & ((1usize << self.shift) - 1);

        self.partitions.get(partition)?.get(local)
    }

    /// A cursor over populated slots across all partitions, in partition
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot<T>> {
        self.partitions.iter().flat_map(Pool::iter)
    }

    /// Visits every populated slot across all partitions.
    pub fn apply(&self, mut f: impl FnMut(&Slot<T>)) {
        for pool in self.partitions.iter() {
            pool.apply(&mut f);
        }
    }

    /// Visits every slot across all partitions, free ones included.
    pub fn apply_all(&self, mut f: impl FnMut(&Slot<T>)) {
        for pool in self.partitions.iter() {
            pool.apply_all(&mut f);
        }
    }

    /// Total configured capacity.
    pub fn row_count(&self) -> usize {
        self.partitions.iter().map(Pool::row_count).sum()
    }

    pub fn populated_count(&self) -> usize {
        self.partitions.iter().map(Pool::populated_count).sum()
    }

    pub fn memory_used(&self) -> usize {
        self.partitions.iter().map(Pool::memory_used).sum()
    }

    /// Allocations refused across all partitions.
    pub fn lost(&self) -> usize {
        self.partitions
            .iter()
            .fold(0usize, |n, p| n.saturating_add(p.lost()))
    }
}

#[cfg(test)]
mod tests {
    use super::PartitionedPool;
    use crate::error::ConfigError;

    #[test]
    fn rejects_bad_configuration() {
        assert_eq!(
            PartitionedPool::<u64>::new(0, 8).err(),
            Some(ConfigError::ZeroPartitions)
        );
        assert_eq!(
            PartitionedPool::<u64>::new(2, 0).err(),
            Some(ConfigError::ZeroCapacity)
        );
    }

    #[test]
    fn flat_indexes_are_unique_and_invertible() {
        let pool: PartitionedPool<u64> = PartitionedPool::with_page_len(4, 6, 2).unwrap();

        let mut flats = Vec::new();
        for p in 0..4 {
            for _ in 0..6 {
                let slot = pool.allocate(p).unwrap().publish();
                flats.push(pool.flat_index(slot));
            }
        }

        let mut unique = flats.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), flats.len());

        for &flat in &flats {
            let slot = pool.get(flat).unwrap();
            assert_eq!(pool.flat_index(slot), flat);
        }
    }

    #[test]
    fn deallocate_finds_the_owning_partition() {
        let pool: PartitionedPool<u64> = PartitionedPool::new(3, 4).unwrap();

        let a = pool.allocate(0).unwrap().publish();
        let b = pool.allocate(2).unwrap().publish();
        assert_eq!(pool.populated_count(), 2);

        // No partition argument needed.
        pool.deallocate(b);
        pool.deallocate(a);
        assert_eq!(pool.populated_count(), 0);
    }

    #[test]
    fn partitions_fail_independently() {
        let pool: PartitionedPool<u64> = PartitionedPool::new(2, 1).unwrap();

        let a = pool.allocate(0).unwrap().publish();
        assert!(pool.allocate(0).is_none());
        assert_eq!(pool.partition(0).lost(), 1);

        // Partition 1 is unaffected.
        let b = pool.allocate(1).unwrap().publish();
        assert_eq!(pool.partition(1).lost(), 0);
        assert_eq!(pool.lost(), 1);

        pool.deallocate(a);
        pool.deallocate(b);
    }

    #[test]
    fn apply_spans_partitions() {
        let pool: PartitionedPool<u64> = PartitionedPool::new(2, 4).unwrap();

        let a = pool.allocate(0).unwrap().publish();
        let b = pool.allocate(1).unwrap().publish();

        let mut seen = Vec::new();
        pool.apply(|slot| seen.push(pool.flat_index(slot)));
        seen.sort_unstable();

        let mut expected = vec![pool.flat_index(a), pool.flat_index(b)];
        expected.sort_unstable();
        assert_eq!(seen, expected);
        assert_eq!(pool.iter().count(), 2);

        pool.deallocate(a);
        pool.deallocate(b);
    }
}
