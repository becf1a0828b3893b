use windows::Win32::Graphics::Direct3D12::*;

use crate::{memory::BlockAllocator, resource::CpuDescriptor, Error};

use super::Check;

struct Page {
    /// Owns the descriptors; only ever addressed through `start`.
    _heap: ID3D12DescriptorHeap,
    start: u64,
    allocator: BlockAllocator,
}

/// A growable set of CPU-only descriptor heaps of one type. Descriptors
/// written here are copied into shader-visible heaps at draw time.
pub struct CpuDescriptorHeap {
    kind: D3D12_DESCRIPTOR_HEAP_TYPE,
    increment: u64,
    page_size: u32,
    pages: Vec<Page>,
}

impl CpuDescriptorHeap {
    pub fn new(device: &ID3D12Device, kind: D3D12_DESCRIPTOR_HEAP_TYPE, page_size: u32) -> Self {
        let increment = u64::from(unsafe { device.GetDescriptorHandleIncrementSize(kind) });

        Self {
            kind,
            increment,
            page_size,
            pages: Vec::new(),
        }
    }

    pub fn increment(&self) -> u32 {
        self.increment as u32
    }

    pub fn allocate(&mut self, device: &ID3D12Device) -> Result<D3D12_CPU_DESCRIPTOR_HANDLE, Error> {
        if let Some(handle) = self.pages.iter_mut().find_map(|page| {
            page.allocator
                .allocate()
                .map(|offset| D3D12_CPU_DESCRIPTOR_HANDLE {
                    ptr: (page.start + offset) as usize,
                })
        }) {
            return Ok(handle);
        }

        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: self.kind,
                NumDescriptors: self.page_size,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                NodeMask: 0,
            })
        }
        .check("CreateDescriptorHeap")?;

        let start = unsafe { heap.GetCPUDescriptorHandleForHeapStart().ptr } as u64;
        let mut allocator = BlockAllocator::new(self.increment, self.page_size);
        let offset = allocator.allocate().ok_or(Error::Memory(
            crate::memory::Error::InsufficientCapacity,
        ))?;

        log::debug!(
            "added descriptor page {} of type {}",
            self.pages.len(),
            self.kind.0
        );

        self.pages.push(Page {
            _heap: heap,
            start,
            allocator,
        });

        Ok(D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: (start + offset) as usize,
        })
    }

    /// Returns a descriptor to its page. Returns false if the descriptor
    /// did not come from this heap.
    pub fn free(&mut self, descriptor: CpuDescriptor) -> bool {
        let page = self.pages.iter_mut().find(|page| {
            descriptor.0 >= page.start && page.allocator.contains(descriptor.0 - page.start)
        });

        match page {
            Some(page) => {
                page.allocator.free(descriptor.0 - page.start);
                true
            }
            None => false,
        }
    }

    pub fn allocated(&self) -> u32 {
        self.pages.iter().map(|page| page.allocator.allocated()).sum()
    }
}
