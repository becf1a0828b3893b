use crate::{
    backend::{Backend, DescriptorHeap, UploadBuffer},
    deletion::{DeletionQueue, Retired},
    resource::{CpuDescriptor, GpuAddress, GpuDescriptor, HeapId, ResourceId},
    types::DescriptorHeapKind,
    Error,
};

use super::LinearAllocator;

/// Memory handed out by a [`ScratchBuffer`]. Valid until the frame slot that
/// owns the buffer is recycled.
pub struct ScratchAllocation<'a> {
    pub data: &'a mut [u8],
    pub address: GpuAddress,
    pub resource: ResourceId,
    pub offset: u64,
}

/// A per-frame bump allocator over a persistently mapped upload buffer.
pub struct ScratchBuffer {
    buffer: UploadBuffer,
    allocator: LinearAllocator,
    max_size: u64,
}

// The mapped pointer is only dereferenced through `&mut self`.
unsafe impl Send for ScratchBuffer {}

impl ScratchBuffer {
    pub fn new<B: Backend + ?Sized>(backend: &B, size: u64, max_size: u64) -> Result<Self, Error> {
        let buffer = backend.create_upload_buffer(size)?;
        Ok(Self {
            allocator: LinearAllocator::new(buffer.size),
            buffer,
            max_size,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.buffer.size
    }

    #[must_use]
    pub fn resource(&self) -> ResourceId {
        self.buffer.resource
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.allocator.allocated()
    }

    pub fn reset(&mut self) {
        self.allocator.clear();
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// On overflow the buffer is replaced by a larger one and the old buffer
    /// is retired at the deletion queue's current cleanup fence. Requests
    /// larger than the configured maximum are refused.
    pub fn allocate<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        deletion: &DeletionQueue,
        size: u64,
        alignment: u64,
    ) -> Result<ScratchAllocation<'_>, Error> {
        if size > self.max_size {
            log::error!(
                "scratch buffer allocation of {size} bytes exceeds the maximum of {} bytes",
                self.max_size
            );
            return Err(Error::AllocationTooLarge {
                requested: size,
                maximum: self.max_size,
            });
        }

        let offset = match self.allocator.allocate(size, alignment) {
            Ok(offset) => offset,
            Err(_) => {
                self.grow(backend, deletion, size)?;
                self.allocator.allocate(size, alignment)?
            }
        };

        // SAFETY: the allocator keeps `offset + size` within the mapping, and
        // ranges handed out since the last reset never overlap.
        let data = unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.ptr.as_ptr().add(offset as usize),
                size as usize,
            )
        };

        Ok(ScratchAllocation {
            data,
            address: self.buffer.address.offset(offset),
            resource: self.buffer.resource,
            offset,
        })
    }

    fn grow<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        deletion: &DeletionQueue,
        requested: u64,
    ) -> Result<(), Error> {
        let current = self.buffer.size;
        let new_size = (current * 2).max(current + requested).min(self.max_size);

        log::info!(
            "scratch buffer ({current} bytes) overflowed, allocating a new buffer of {new_size} bytes"
        );

        let buffer = backend.create_upload_buffer(new_size).map_err(|e| {
            log::error!("failed to allocate a scratch buffer of {new_size} bytes: {e}");
            e
        })?;

        let old = std::mem::replace(&mut self.buffer, buffer);
        deletion.retire(Retired::Resource(old.resource));
        self.allocator = LinearAllocator::new(new_size);
        Ok(())
    }

    pub fn release(self, deletion: &DeletionQueue) {
        deletion.retire(Retired::Resource(self.buffer.resource));
    }
}

/// A contiguous run of descriptors in a scratch heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorAllocation {
    pub cpu: CpuDescriptor,
    pub gpu: GpuDescriptor,
    /// Set when the heap was replaced to satisfy this allocation. Tables
    /// staged earlier in the frame live in the retired heap.
    pub grew: bool,
}

/// A per-frame bump allocator over a shader-visible descriptor heap.
pub struct ScratchDescriptorHeap {
    heap: DescriptorHeap,
    allocator: LinearAllocator,
    max_capacity: u32,
}

impl ScratchDescriptorHeap {
    pub fn new<B: Backend + ?Sized>(
        backend: &B,
        kind: DescriptorHeapKind,
        capacity: u32,
        max_capacity: u32,
    ) -> Result<Self, Error> {
        let heap = backend.create_descriptor_heap(kind, capacity)?;
        Ok(Self {
            allocator: LinearAllocator::new(u64::from(heap.capacity)),
            heap,
            max_capacity,
        })
    }

    #[must_use]
    pub fn id(&self) -> HeapId {
        self.heap.id
    }

    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.heap.kind
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    pub fn reset(&mut self) {
        self.allocator.clear();
    }

    pub fn allocate<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        deletion: &DeletionQueue,
        count: u32,
    ) -> Result<DescriptorAllocation, Error> {
        if count > self.max_capacity {
            log::error!(
                "scratch {:?} heap allocation of {count} descriptors exceeds the maximum of {}",
                self.heap.kind,
                self.max_capacity
            );
            return Err(Error::AllocationTooLarge {
                requested: u64::from(count),
                maximum: u64::from(self.max_capacity),
            });
        }

        let (offset, grew) = match self.allocator.allocate(u64::from(count), 1) {
            Ok(offset) => (offset, false),
            Err(_) => {
                self.grow(backend, deletion, count)?;
                (self.allocator.allocate(u64::from(count), 1)?, true)
            }
        };

        let offset = offset as u32;
        Ok(DescriptorAllocation {
            cpu: self.heap.cpu_start.offset(offset, self.heap.increment),
            gpu: self.heap.gpu_start.offset(offset, self.heap.increment),
            grew,
        })
    }

    fn grow<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        deletion: &DeletionQueue,
        requested: u32,
    ) -> Result<(), Error> {
        let current = self.heap.capacity;
        let new_capacity = current
            .saturating_mul(2)
            .max(current.saturating_add(requested))
            .min(self.max_capacity);

        log::info!(
            "scratch {:?} heap ({current} entries) overflowed, allocating a new heap of {new_capacity} entries",
            self.heap.kind
        );

        let heap = backend
            .create_descriptor_heap(self.heap.kind, new_capacity)
            .map_err(|e| {
                log::error!("failed to allocate a scratch heap of {new_capacity} entries: {e}");
                e
            })?;

        let old = std::mem::replace(&mut self.heap, heap);
        deletion.retire(Retired::DescriptorHeap(old.id));
        self.allocator = LinearAllocator::new(u64::from(new_capacity));
        Ok(())
    }

    pub fn release(self, deletion: &DeletionQueue) {
        deletion.retire(Retired::DescriptorHeap(self.heap.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Destroyed, RecordingBackend};

    #[test]
    fn buffer_overflow_grows_and_defers_deletion() {
        let backend = RecordingBackend::new();
        let deletion = DeletionQueue::new();
        deletion.set_cleanup_fence(4);

        let mut scratch = ScratchBuffer::new(&backend, 1024, 1 << 20).unwrap();
        let old = scratch.resource();

        scratch.allocate(&backend, &deletion, 1000, 1).unwrap();
        let allocation = scratch.allocate(&backend, &deletion, 100, 1).unwrap();
        assert_ne!(allocation.resource, old);
        assert_eq!(allocation.offset, 0);
        assert_eq!(scratch.size(), 2048);

        assert_eq!(deletion.collect(3, &backend), 0);
        assert!(!backend.is_destroyed(Destroyed::Resource(old)));
        assert_eq!(deletion.collect(4, &backend), 1);
        assert!(backend.is_destroyed(Destroyed::Resource(old)));
    }

    #[test]
    fn growth_is_clamped_and_oversize_refused() {
        let backend = RecordingBackend::new();
        let deletion = DeletionQueue::new();
        let mut scratch = ScratchBuffer::new(&backend, 1024, 1536).unwrap();

        scratch.allocate(&backend, &deletion, 1024, 1).unwrap();
        scratch.allocate(&backend, &deletion, 1, 1).unwrap();
        assert_eq!(scratch.size(), 1536);

        assert!(matches!(
            scratch.allocate(&backend, &deletion, 1537, 1),
            Err(Error::AllocationTooLarge {
                requested: 1537,
                maximum: 1536
            })
        ));
    }

    #[test]
    fn allocations_are_writable_and_aligned() {
        let backend = RecordingBackend::new();
        let deletion = DeletionQueue::new();
        let mut scratch = ScratchBuffer::new(&backend, 4096, 4096).unwrap();

        scratch.allocate(&backend, &deletion, 3, 1).unwrap();
        let allocation = scratch.allocate(&backend, &deletion, 4, 256).unwrap();
        allocation.data.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(allocation.offset, 256);
        assert_eq!(allocation.address.0 % 256, 0);
    }

    #[test]
    fn heap_growth_is_reported() {
        let backend = RecordingBackend::new();
        let deletion = DeletionQueue::new();
        let mut heap =
            ScratchDescriptorHeap::new(&backend, DescriptorHeapKind::View, 4, 64).unwrap();
        let old = heap.id();

        assert!(!heap.allocate(&backend, &deletion, 3).unwrap().grew);
        let allocation = heap.allocate(&backend, &deletion, 3).unwrap();
        assert!(allocation.grew);
        assert_eq!(heap.capacity(), 8);
        assert_ne!(heap.id(), old);
        assert_eq!(deletion.len(), 1);
    }
}
