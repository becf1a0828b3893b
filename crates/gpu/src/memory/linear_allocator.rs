use super::{next_multiple_of, Error};

/// A bump allocator over an abstract range of `capacity` units. It hands out
/// offsets only; the owner maps them onto bytes or descriptors.
#[derive(Debug)]
pub struct LinearAllocator {
    capacity: u64,
    allocated: u64,
}

impl LinearAllocator {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated: 0,
        }
    }

    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.allocated == self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn can_fit(&self, size: u64, align: u64) -> bool {
        self.alloc_end(size, align) <= self.capacity
    }

    /// Reserves `size` units aligned to `align` and returns the offset of the
    /// first.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<u64, Error> {
        if size > self.capacity {
            return Err(Error::InsufficientCapacity);
        }

        let end = self.alloc_end(size, align);
        if end > self.capacity {
            return Err(Error::OutOfMemory {
                capacity: self.capacity,
                available: self.capacity - self.allocated,
                requested: size,
            });
        }

        let offset = end - size;
        self.allocated = end;
        Ok(offset)
    }

    pub fn clear(&mut self) {
        self.allocated = 0;
    }

    fn alloc_end(&self, size: u64, align: u64) -> u64 {
        next_multiple_of(self.allocated, align.max(1)) + size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_bump() {
        let mut allocator = LinearAllocator::new(1024);

        assert_eq!(allocator.allocate(10, 1), Ok(0));
        assert_eq!(allocator.allocate(16, 256), Ok(256));
        assert_eq!(allocator.allocated(), 272);
        assert!(allocator.can_fit(256, 256));
        assert!(!allocator.can_fit(513, 256));
    }

    #[test]
    fn exhaustion() {
        let mut allocator = LinearAllocator::new(64);

        assert_eq!(allocator.allocate(65, 1), Err(Error::InsufficientCapacity));
        assert_eq!(allocator.allocate(64, 1), Ok(0));
        assert!(allocator.is_full());
        assert_eq!(
            allocator.allocate(1, 1),
            Err(Error::OutOfMemory {
                capacity: 64,
                available: 0,
                requested: 1
            })
        );

        allocator.clear();
        assert_eq!(allocator.allocate(1, 1), Ok(0));
    }
}
