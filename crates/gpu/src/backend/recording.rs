//! A portable backend that executes nothing and remembers everything.
//!
//! Every encoded [`Command`] and every create/destroy call is appended to an
//! ordered event log. The queue fence is simulated: it either completes on
//! signal, or is advanced by hand (possibly from another thread) with
//! [`RecordingBackend::complete_through`].

use std::{
    collections::{BTreeMap, HashMap},
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::{Condvar, Mutex};
use raw_window_handle::RawWindowHandle;
use smallvec::SmallVec;
use structures::{GenerationalPool, Handle};

use crate::{
    memory::next_multiple_of,
    resource::{
        AllocatorId, Buffer, BufferDesc, CommandListId, CpuDescriptor, GpuAddress, GpuDescriptor,
        HeapId, PipelineId, RenderTargetView, ResourceId, SwapChainId, Texture, TextureDesc,
        ViewDesc,
    },
    types::{BindingFamily, DescriptorHeapKind, ResourceState, SamplerDesc},
    Error,
};

use super::{
    Backend, Command, DescriptorHeap, PipelineDesc, SwapChain, SwapChainDesc, UploadBuffer,
};

/// Something the backend was asked to do, in call order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Encode(CommandListId, Command),
    Close(CommandListId),
    Execute(CommandListId),
    Signal(u64),
    Present(SwapChainId),
    ResizeSwapChain(SwapChainId),
    CompilePipeline(PipelineId),
    Destroy(Destroyed),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destroyed {
    Resource(ResourceId),
    View(CpuDescriptor),
    DescriptorHeap(HeapId),
    Pipeline(PipelineId),
    CommandList(CommandListId),
    CommandAllocator(AllocatorId),
}

const PLACEMENT_ALIGNMENT: u64 = 64 * 1024;
const HEAP_STRIDE: u64 = 1 << 32;
const GPU_DESCRIPTOR_BIT: u64 = 1 << 62;
const NULL_DESCRIPTOR_BASE: u64 = u64::MAX - 16;

struct ResourceRecord {
    /// Backing store for upload buffers. Boxed so the mapped pointer stays
    /// put while the pool grows.
    memory: Option<Box<[u8]>>,
}

struct HeapRecord {
    id: HeapId,
    contents: Vec<Option<CpuDescriptor>>,
}

struct FenceState {
    signaled: u64,
    completed: u64,
    waiters: usize,
}

pub struct RecordingBackend {
    events: Mutex<Vec<Event>>,
    resources: Mutex<GenerationalPool<ResourceRecord>>,
    heaps: Mutex<BTreeMap<u64, HeapRecord>>,
    swap_chains: Mutex<HashMap<SwapChainId, (SwapChainDesc, SmallVec<[RenderTargetView; 3]>)>>,
    next_id: AtomicU64,
    next_address: AtomicU64,
    presents: AtomicU64,

    fence: Mutex<FenceState>,
    fence_signal: Condvar,
    auto_complete: AtomicBool,
    waits: AtomicUsize,

    fail_next_close: AtomicBool,
    fail_pipelines: AtomicBool,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    /// A backend whose fence completes as soon as it is signaled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            resources: Mutex::new(GenerationalPool::new()),
            heaps: Mutex::new(BTreeMap::new()),
            swap_chains: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_address: AtomicU64::new(PLACEMENT_ALIGNMENT),
            presents: AtomicU64::new(0),
            fence: Mutex::new(FenceState {
                signaled: 0,
                completed: 0,
                waiters: 0,
            }),
            fence_signal: Condvar::new(),
            auto_complete: AtomicBool::new(true),
            waits: AtomicUsize::new(0),
            fail_next_close: AtomicBool::new(false),
            fail_pipelines: AtomicBool::new(false),
        }
    }

    /// A backend whose fence only advances through
    /// [`RecordingBackend::complete_through`].
    #[must_use]
    pub fn manual() -> Self {
        let backend = Self::new();
        backend.auto_complete.store(false, Ordering::Relaxed);
        backend
    }

    /// Simulates GPU progress up to and including `value`.
    pub fn complete_through(&self, value: u64) {
        let mut fence = self.fence.lock();
        fence.completed = fence.completed.max(value);
        self.fence_signal.notify_all();
    }

    /// The highest value signaled on the queue so far.
    #[must_use]
    pub fn signaled_value(&self) -> u64 {
        self.fence.lock().signaled
    }

    /// The number of threads currently blocked on the fence.
    #[must_use]
    pub fn blocked_waiters(&self) -> usize {
        self.fence.lock().waiters
    }

    /// The number of fence waits that had to block.
    #[must_use]
    pub fn blocking_waits(&self) -> usize {
        self.waits.load(Ordering::Acquire)
    }

    /// Makes the next command list close fail.
    pub fn fail_next_close(&self) {
        self.fail_next_close.store(true, Ordering::Release);
    }

    /// Makes every pipeline compilation fail while set.
    pub fn fail_pipelines(&self, fail: bool) {
        self.fail_pipelines.store(fail, Ordering::Release);
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Every encoded command in order, regardless of command list.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Encode(_, command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forgets the events recorded so far.
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn count_commands(&self, mut predicate: impl FnMut(&Command) -> bool) -> usize {
        self.commands().iter().filter(|c| predicate(c)).count()
    }

    #[must_use]
    pub fn compiled_pipelines(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::CompilePipeline(_)))
            .count()
    }

    #[must_use]
    pub fn is_destroyed(&self, what: Destroyed) -> bool {
        self.events.lock().contains(&Event::Destroy(what))
    }

    /// Reads back `count` descriptors of a staged table.
    #[must_use]
    pub fn descriptor_table(&self, table: GpuDescriptor, count: u32) -> Vec<Option<CpuDescriptor>> {
        let cpu = table.0 & !GPU_DESCRIPTOR_BIT;
        let heaps = self.heaps.lock();
        let Some((start, heap)) = heaps.range(..=cpu).next_back() else {
            return Vec::new();
        };
        let first = (cpu - start) as usize;
        heap.contents
            .get(first..first + count as usize)
            .map(<[_]>::to_vec)
            .unwrap_or_default()
    }

    /// The shader-visible heap a staged table points into.
    #[must_use]
    pub fn descriptor_heap_of(&self, table: GpuDescriptor) -> Option<HeapId> {
        let cpu = table.0 & !GPU_DESCRIPTOR_BIT;
        self.heaps.lock().range(..=cpu).next_back().map(|(_, heap)| heap.id)
    }

    fn log(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_address(&self, size: u64) -> GpuAddress {
        let size = next_multiple_of(size.max(1), PLACEMENT_ALIGNMENT);
        GpuAddress(self.next_address.fetch_add(size, Ordering::Relaxed))
    }

    fn insert_resource(&self, memory: Option<Box<[u8]>>) -> ResourceId {
        ResourceId(self.resources.lock().insert(ResourceRecord { memory }).to_bits())
    }

    fn create_back_buffers(&self, desc: &SwapChainDesc) -> SmallVec<[RenderTargetView; 3]> {
        (0..desc.buffer_count)
            .map(|_| RenderTargetView {
                descriptor: CpuDescriptor(self.next_id()),
                texture: Texture {
                    id: self.insert_resource(None),
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    default_state: ResourceState::Present,
                },
            })
            .collect()
    }
}

impl Backend for RecordingBackend {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer, Error> {
        Ok(Buffer {
            id: self.insert_resource(None),
            address: self.allocate_address(desc.size),
            size: desc.size,
            usage: desc.usage,
            default_state: desc.usage.default_state(),
        })
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Texture, Error> {
        Ok(Texture {
            id: self.insert_resource(None),
            width: desc.width,
            height: desc.height,
            format: desc.format,
            default_state: desc.default_state(),
        })
    }

    fn create_upload_buffer(&self, size: u64) -> Result<UploadBuffer, Error> {
        let mut memory = vec![0u8; size as usize].into_boxed_slice();
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());

        Ok(UploadBuffer {
            resource: self.insert_resource(Some(memory)),
            ptr,
            address: self.allocate_address(size),
            size,
        })
    }

    fn destroy_resource(&self, resource: ResourceId) {
        if let Some(handle) = Handle::from_bits(resource.0) {
            self.resources.lock().remove(handle);
        }
        self.log(Event::Destroy(Destroyed::Resource(resource)));
    }

    fn create_view(&self, _desc: &ViewDesc) -> Result<CpuDescriptor, Error> {
        Ok(CpuDescriptor(self.next_id()))
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<CpuDescriptor, Error> {
        Ok(CpuDescriptor(self.next_id()))
    }

    fn destroy_view(&self, descriptor: CpuDescriptor) {
        self.log(Event::Destroy(Destroyed::View(descriptor)));
    }

    fn null_descriptor(&self, family: BindingFamily) -> CpuDescriptor {
        let offset = BindingFamily::ALL
            .iter()
            .position(|f| *f == family)
            .unwrap_or_default();
        CpuDescriptor(NULL_DESCRIPTOR_BASE + offset as u64)
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeap, Error> {
        let id = HeapId(self.next_id());
        let cpu_start = id.0 * HEAP_STRIDE;

        self.heaps.lock().insert(
            cpu_start,
            HeapRecord {
                id,
                contents: vec![None; capacity as usize],
            },
        );

        Ok(DescriptorHeap {
            id,
            kind,
            cpu_start: CpuDescriptor(cpu_start),
            gpu_start: GpuDescriptor(cpu_start | GPU_DESCRIPTOR_BIT),
            increment: 1,
            capacity,
        })
    }

    fn destroy_descriptor_heap(&self, heap: HeapId) {
        self.heaps.lock().retain(|_, record| record.id != heap);
        self.log(Event::Destroy(Destroyed::DescriptorHeap(heap)));
    }

    fn copy_descriptors(&self, _kind: DescriptorHeapKind, dst: CpuDescriptor, src: &[CpuDescriptor]) {
        let mut heaps = self.heaps.lock();
        if let Some((start, heap)) = heaps.range_mut(..=dst.0).next_back() {
            let first = (dst.0 - start) as usize;
            for (slot, descriptor) in heap.contents[first..].iter_mut().zip(src) {
                *slot = Some(*descriptor);
            }
        }
    }

    fn create_pipeline(&self, _desc: &PipelineDesc) -> Result<PipelineId, Error> {
        if self.fail_pipelines.load(Ordering::Acquire) {
            return Err(Error::PipelineCompilation("rejected by test backend".into()));
        }

        let id = PipelineId(self.next_id());
        self.log(Event::CompilePipeline(id));
        Ok(id)
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.log(Event::Destroy(Destroyed::Pipeline(pipeline)));
    }

    fn create_command_allocator(&self) -> Result<AllocatorId, Error> {
        Ok(AllocatorId(self.next_id()))
    }

    fn reset_command_allocator(&self, _allocator: AllocatorId) -> Result<(), Error> {
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        self.log(Event::Destroy(Destroyed::CommandAllocator(allocator)));
    }

    fn create_command_list(&self, _allocator: AllocatorId) -> Result<CommandListId, Error> {
        Ok(CommandListId(self.next_id()))
    }

    fn reset_command_list(
        &self,
        _list: CommandListId,
        _allocator: AllocatorId,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn close_command_list(&self, list: CommandListId) -> Result<(), Error> {
        if self.fail_next_close.swap(false, Ordering::AcqRel) {
            return Err(Error::Backend {
                call: "Close",
                code: -2_147_024_809, // E_INVALIDARG
            });
        }

        self.log(Event::Close(list));
        Ok(())
    }

    fn destroy_command_list(&self, list: CommandListId) {
        self.log(Event::Destroy(Destroyed::CommandList(list)));
    }

    fn encode(&self, list: CommandListId, command: &Command) {
        self.log(Event::Encode(list, command.clone()));
    }

    fn execute(&self, list: CommandListId) {
        self.log(Event::Execute(list));
    }

    fn signal(&self, value: u64) -> Result<(), Error> {
        self.log(Event::Signal(value));

        let mut fence = self.fence.lock();
        fence.signaled = fence.signaled.max(value);
        if self.auto_complete.load(Ordering::Acquire) {
            fence.completed = fence.signaled;
            self.fence_signal.notify_all();
        }
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.fence.lock().completed
    }

    fn wait_for_value(&self, value: u64) -> Result<(), Error> {
        let mut fence = self.fence.lock();
        if fence.completed >= value {
            return Ok(());
        }

        self.waits.fetch_add(1, Ordering::AcqRel);
        fence.waiters += 1;
        while fence.completed < value {
            self.fence_signal.wait(&mut fence);
        }
        fence.waiters -= 1;
        Ok(())
    }

    fn create_swap_chain(
        &self,
        window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> Result<SwapChain, Error> {
        if matches!(window, RawWindowHandle::Wayland(_)) {
            return Err(Error::UnsupportedWindow);
        }

        let id = SwapChainId(self.next_id());
        let back_buffers = self.create_back_buffers(desc);
        self.swap_chains
            .lock()
            .insert(id, (*desc, back_buffers.clone()));

        Ok(SwapChain {
            id,
            width: desc.width,
            height: desc.height,
            back_buffers,
        })
    }

    fn resize_swap_chain(
        &self,
        swap_chain: SwapChainId,
        desc: &SwapChainDesc,
    ) -> Result<SwapChain, Error> {
        let old = self
            .swap_chains
            .lock()
            .remove(&swap_chain)
            .ok_or(Error::InvalidHandle)?;

        for view in old.1 {
            self.destroy_view(view.descriptor);
            self.destroy_resource(view.texture.id);
        }

        self.log(Event::ResizeSwapChain(swap_chain));
        let back_buffers = self.create_back_buffers(desc);
        self.swap_chains
            .lock()
            .insert(swap_chain, (*desc, back_buffers.clone()));

        Ok(SwapChain {
            id: swap_chain,
            width: desc.width,
            height: desc.height,
            back_buffers,
        })
    }

    fn present(&self, swap_chain: SwapChainId, _sync_interval: u32) -> Result<(), Error> {
        self.presents.fetch_add(1, Ordering::AcqRel);
        self.log(Event::Present(swap_chain));
        Ok(())
    }

    fn current_back_buffer(&self, swap_chain: SwapChainId) -> u32 {
        let count = self
            .swap_chains
            .lock()
            .get(&swap_chain)
            .map_or(1, |(desc, _)| desc.buffer_count.max(1));
        (self.presents.load(Ordering::Acquire) % u64::from(count)) as u32
    }

    fn destroy_swap_chain(&self, swap_chain: SwapChainId) {
        if let Some((_, views)) = self.swap_chains.lock().remove(&swap_chain) {
            for view in views {
                self.destroy_view(view.descriptor);
                self.destroy_resource(view.texture.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn descriptor_tables_read_back() {
        let backend = RecordingBackend::new();
        let heap = backend
            .create_descriptor_heap(DescriptorHeapKind::View, 8)
            .unwrap();

        let a = CpuDescriptor(7);
        let b = CpuDescriptor(9);
        backend.copy_descriptors(DescriptorHeapKind::View, heap.cpu_start.offset(2, 1), &[a, b]);

        assert_eq!(
            backend.descriptor_table(heap.gpu_start.offset(2, 1), 2),
            vec![Some(a), Some(b)]
        );
        assert_eq!(backend.descriptor_table(heap.gpu_start, 1), vec![None]);
    }

    #[test]
    fn manual_fence_blocks_until_completed() {
        let backend = Arc::new(RecordingBackend::manual());
        backend.signal(1).unwrap();
        assert_eq!(backend.completed_value(), 0);

        let waiter = {
            let backend = backend.clone();
            std::thread::spawn(move || backend.wait_for_value(1))
        };

        while backend.blocked_waiters() == 0 {
            std::thread::yield_now();
        }

        backend.complete_through(1);
        waiter.join().unwrap().unwrap();
        assert_eq!(backend.blocking_waits(), 1);
    }

    #[test]
    fn upload_buffers_are_writable() {
        let backend = RecordingBackend::new();
        let upload = backend.create_upload_buffer(16).unwrap();

        unsafe { upload.ptr.as_ptr().add(15).write(0xab) };
        assert_eq!(upload.size, 16);
        assert_eq!(upload.address.0 % PLACEMENT_ALIGNMENT, 0);

        backend.destroy_resource(upload.resource);
        assert!(backend.is_destroyed(Destroyed::Resource(upload.resource)));
    }
}
