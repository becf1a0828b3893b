/// Hands out fixed-size blocks from a region through an intrusive free
/// list. Offsets are in bytes from the start of the region.
#[derive(Debug)]
pub struct BlockAllocator {
    next_free: Vec<u32>,
    block_size: u64,
    first_free: u32,
    allocated: u32,
}

impl BlockAllocator {
    #[must_use]
    pub fn new(block_size: u64, block_count: u32) -> Self {
        assert!(block_size > 0);

        Self {
            next_free: (1..=block_count).collect(),
            block_size,
            first_free: 0,
            allocated: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.next_free.len() as u32
    }

    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.first_free as usize >= self.next_free.len()
    }

    /// Whether `offset` lies inside the region, allocated or not.
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        offset < self.block_size * u64::from(self.capacity())
    }

    pub fn allocate(&mut self) -> Option<u64> {
        if self.is_full() {
            return None;
        }

        let block = self.first_free;
        self.first_free = self.next_free[block as usize];
        self.allocated += 1;
        Some(u64::from(block) * self.block_size)
    }

    pub fn free(&mut self, offset: u64) {
        debug_assert_eq!(offset % self.block_size, 0);
        debug_assert!(self.contains(offset));

        let block = (offset / self.block_size) as u32;
        self.next_free[block as usize] = self.first_free;
        self.first_free = block;
        self.allocated -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_handed_out_in_order() {
        let mut allocator = BlockAllocator::new(8, 4);

        assert_eq!(allocator.allocate(), Some(0));
        assert_eq!(allocator.allocate(), Some(8));
        assert_eq!(allocator.allocate(), Some(16));
        assert_eq!(allocator.allocate(), Some(24));
        assert_eq!(allocator.allocate(), None);
        assert!(allocator.is_full());
    }

    #[test]
    fn freed_blocks_are_reused_last_in_first_out() {
        let mut allocator = BlockAllocator::new(32, 4);
        let blocks: Vec<_> = std::iter::from_fn(|| allocator.allocate()).collect();
        assert_eq!(blocks.len(), 4);

        allocator.free(blocks[1]);
        allocator.free(blocks[3]);
        assert_eq!(allocator.allocated(), 2);

        assert_eq!(allocator.allocate(), Some(blocks[3]));
        assert_eq!(allocator.allocate(), Some(blocks[1]));
        assert_eq!(allocator.allocate(), None);
    }

    #[test]
    fn containment_covers_the_whole_region() {
        let allocator = BlockAllocator::new(16, 2);
        assert!(allocator.contains(0));
        assert!(allocator.contains(31));
        assert!(!allocator.contains(32));
    }
}
