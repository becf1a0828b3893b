mod block_allocator;
mod linear_allocator;
mod scratch;

pub use block_allocator::BlockAllocator;
pub use linear_allocator::LinearAllocator;
pub use scratch::{DescriptorAllocation, ScratchAllocation, ScratchBuffer, ScratchDescriptorHeap};

/// Placement alignment for constant data read by shaders.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The heap does not have enough free memory to satisfy the allocation
    /// request.
    #[error("out of memory: requested {requested} with {available} of {capacity} available")]
    OutOfMemory {
        capacity: u64,
        available: u64,
        requested: u64,
    },
    /// The heap is not large enough to satisfy the allocation request.
    #[error("allocation exceeds heap capacity")]
    InsufficientCapacity,
}

pub(crate) fn next_multiple_of(a: u64, b: u64) -> u64 {
    match a % b {
        0 => a,
        r => a + b - r,
    }
}
