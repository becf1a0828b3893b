//! The seam between the state-tracking layer and a native graphics API.
//!
//! Everything above this module is written once against [`Backend`]. A
//! backend hands out opaque ids for the objects it creates, encodes
//! [`Command`]s into its native command lists, and exposes a single
//! monotonically increasing queue fence.

#[cfg(target_os = "windows")]
pub mod dx12;
pub mod recording;

use std::ptr::NonNull;

use geometry::{ScissorRect, Viewport};
use raw_window_handle::RawWindowHandle;
use smallvec::SmallVec;

use crate::{
    pipeline_cache::PipelineStateKey,
    resource::{
        AllocatorId, Buffer, BufferDesc, CommandListId, CpuDescriptor, GpuAddress, GpuDescriptor,
        HeapId, PipelineId, RenderTargetView, ResourceId, SwapChainId, Texture, TextureDesc,
        ViewDesc,
    },
    types::{
        BindingFamily, DescriptorHeapKind, IndexFormat, PixelFormat, PrimitiveTopology,
        ResourceState, SamplerDesc, VertexElementDesc, MAX_RENDER_TARGETS, STAGE_COUNT,
    },
    Error,
};

/// A CPU-visible buffer in upload memory, mapped for the whole of its life.
#[derive(Debug)]
pub struct UploadBuffer {
    pub resource: ResourceId,
    pub ptr: NonNull<u8>,
    pub address: GpuAddress,
    pub size: u64,
}

/// A shader-visible descriptor heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHeap {
    pub id: HeapId,
    pub kind: DescriptorHeapKind,
    pub cpu_start: CpuDescriptor,
    pub gpu_start: GpuDescriptor,
    pub increment: u32,
    pub capacity: u32,
}

/// Everything needed to compile one pipeline object.
#[derive(Clone, Copy, Debug)]
pub struct PipelineDesc<'a> {
    /// Bytecode per [`ShaderStage`](crate::ShaderStage) index. Empty slices
    /// mark absent stages.
    pub stages: [&'a [u8]; STAGE_COUNT],
    pub vertex_elements: &'a [VertexElementDesc],
    /// Ignored for compute pipelines.
    pub key: &'a PipelineStateKey,
}

impl PipelineDesc<'_> {
    #[must_use]
    pub fn is_compute(&self) -> bool {
        !self.stages[crate::ShaderStage::Compute.index()].is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapChainDesc {
    /// Zero matches the window's client area.
    pub width: u32,
    /// Zero matches the window's client area.
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

#[derive(Clone, Debug)]
pub struct SwapChain {
    pub id: SwapChainId,
    pub width: u32,
    pub height: u32,
    pub back_buffers: SmallVec<[RenderTargetView; 3]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Barrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBufferView {
    pub address: GpuAddress,
    pub size: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexBufferView {
    pub address: GpuAddress,
    pub size: u32,
    pub format: IndexFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct ClearFlags {
    pub depth: bool,
    pub stencil: bool,
}

/// A single command-list operation. Backends translate these one to one
/// into their native command list calls.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Barrier(SmallVec<[Barrier; 4]>),
    SetDescriptorHeaps {
        view: HeapId,
        sampler: HeapId,
    },
    SetRootSignatures,
    SetPipeline(PipelineId),
    SetGraphicsTable {
        parameter: u32,
        table: GpuDescriptor,
    },
    SetComputeTable {
        parameter: u32,
        table: GpuDescriptor,
    },
    SetGraphicsConstantBuffer {
        parameter: u32,
        address: GpuAddress,
    },
    SetComputeConstantBuffer {
        parameter: u32,
        address: GpuAddress,
    },
    SetRenderTargets {
        render_targets: SmallVec<[Option<CpuDescriptor>; MAX_RENDER_TARGETS]>,
        depth_stencil: Option<CpuDescriptor>,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetTopology(PrimitiveTopology),
    SetVertexBuffers {
        first: u32,
        views: SmallVec<[Option<VertexBufferView>; 4]>,
    },
    SetIndexBuffer(Option<IndexBufferView>),
    SetBlendFactor([f32; 4]),
    SetStencilRef(u8),
    ClearRenderTarget {
        view: CpuDescriptor,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: CpuDescriptor,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    },
    DiscardResource(ResourceId),
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// A native graphics API. Implementations use interior locking so that a
/// single backend can be shared by the device and every context.
pub trait Backend: Send + Sync + 'static {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer, Error>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<Texture, Error>;
    fn create_upload_buffer(&self, size: u64) -> Result<UploadBuffer, Error>;
    fn destroy_resource(&self, resource: ResourceId);

    /// Writes a view into a fresh CPU-only descriptor.
    fn create_view(&self, desc: &ViewDesc) -> Result<CpuDescriptor, Error>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<CpuDescriptor, Error>;
    fn destroy_view(&self, descriptor: CpuDescriptor);

    /// A descriptor holding the null view of a family. It is copied into
    /// binding tables in place of unbound slots.
    fn null_descriptor(&self, family: BindingFamily) -> CpuDescriptor;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeap, Error>;
    fn destroy_descriptor_heap(&self, heap: HeapId);

    /// Copies `src` into consecutive descriptors starting at `dst`.
    fn copy_descriptors(&self, kind: DescriptorHeapKind, dst: CpuDescriptor, src: &[CpuDescriptor]);

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId, Error>;
    fn destroy_pipeline(&self, pipeline: PipelineId);

    fn create_command_allocator(&self) -> Result<AllocatorId, Error>;
    fn reset_command_allocator(&self, allocator: AllocatorId) -> Result<(), Error>;
    fn destroy_command_allocator(&self, allocator: AllocatorId);

    /// Creates a command list in the recording state.
    fn create_command_list(&self, allocator: AllocatorId) -> Result<CommandListId, Error>;
    fn reset_command_list(&self, list: CommandListId, allocator: AllocatorId)
        -> Result<(), Error>;
    fn close_command_list(&self, list: CommandListId) -> Result<(), Error>;
    fn destroy_command_list(&self, list: CommandListId);
    fn encode(&self, list: CommandListId, command: &Command);

    fn execute(&self, list: CommandListId);
    fn signal(&self, value: u64) -> Result<(), Error>;
    fn completed_value(&self) -> u64;
    /// Blocks until the queue fence reaches `value`.
    fn wait_for_value(&self, value: u64) -> Result<(), Error>;

    fn create_swap_chain(
        &self,
        window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> Result<SwapChain, Error>;
    /// Releases the old back buffers and their views, then resizes. The
    /// caller guarantees the GPU is no longer using them.
    fn resize_swap_chain(&self, swap_chain: SwapChainId, desc: &SwapChainDesc)
        -> Result<SwapChain, Error>;
    fn present(&self, swap_chain: SwapChainId, sync_interval: u32) -> Result<(), Error>;
    fn current_back_buffer(&self, swap_chain: SwapChainId) -> u32;
    fn destroy_swap_chain(&self, swap_chain: SwapChainId);
}
