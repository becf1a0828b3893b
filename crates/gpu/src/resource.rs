//! Opaque handles to backend objects and the value types that describe them.
//!
//! Handles are plain integers minted by a [`Backend`](crate::Backend). They
//! are only meaningful to the backend that created them.

use crate::types::{PixelFormat, ResourceState};

macro_rules! id_type {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

id_type!(
    /// A buffer or texture.
    ResourceId,
    /// The CPU-side location of a descriptor (view or sampler).
    CpuDescriptor,
    /// The GPU-side location of a descriptor in a shader-visible heap.
    GpuDescriptor,
    /// A byte address in GPU virtual memory.
    GpuAddress,
    PipelineId,
    HeapId,
    AllocatorId,
    CommandListId,
    SwapChainId,
);

impl CpuDescriptor {
    /// Offsets the descriptor by `index` entries of `increment` bytes.
    #[must_use]
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

impl GpuDescriptor {
    #[must_use]
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

impl GpuAddress {
    #[must_use]
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// A resource together with the state it is expected to rest in between
/// uses. This is everything the state tracker needs to know about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tracked {
    pub id: ResourceId,
    pub default_state: ResourceState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Constant,
    Structured,
}

impl BufferUsage {
    #[must_use]
    pub fn default_state(self) -> ResourceState {
        match self {
            Self::Vertex | Self::Constant => ResourceState::VertexAndConstantBuffer,
            Self::Index => ResourceState::IndexBuffer,
            Self::Structured => ResourceState::ShaderResource,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    /// Allow binding the buffer as an unordered-access view.
    pub writable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Buffer {
    pub id: ResourceId,
    pub address: GpuAddress,
    pub size: u64,
    pub usage: BufferUsage,
    pub default_state: ResourceState,
}

impl Buffer {
    #[must_use]
    pub fn tracked(&self) -> Tracked {
        Tracked {
            id: self.id,
            default_state: self.default_state,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: PixelFormat,
    pub render_target: bool,
    pub depth_stencil: bool,
    pub unordered_access: bool,
}

impl TextureDesc {
    /// A single-mip color texture that can be rendered to and sampled.
    #[must_use]
    pub fn render_target(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            format,
            render_target: true,
            depth_stencil: false,
            unordered_access: false,
        }
    }

    #[must_use]
    pub fn depth_stencil(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            format,
            render_target: false,
            depth_stencil: true,
            unordered_access: false,
        }
    }

    /// The state a texture created from this description rests in.
    #[must_use]
    pub fn default_state(&self) -> ResourceState {
        if self.depth_stencil {
            ResourceState::DepthWrite
        } else {
            ResourceState::ShaderResource
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Texture {
    pub id: ResourceId,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub default_state: ResourceState,
}

impl Texture {
    #[must_use]
    pub fn tracked(&self) -> Tracked {
        Tracked {
            id: self.id,
            default_state: self.default_state,
        }
    }
}

/// Describes a view to be written into a CPU-only descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewDesc {
    ConstantBuffer {
        buffer: ResourceId,
        address: GpuAddress,
        size: u32,
    },
    ShaderResource {
        resource: ResourceId,
        format: PixelFormat,
    },
    UnorderedAccess {
        resource: ResourceId,
        format: PixelFormat,
    },
    RenderTarget {
        resource: ResourceId,
        format: PixelFormat,
    },
    DepthStencil {
        resource: ResourceId,
        format: PixelFormat,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetView {
    pub descriptor: CpuDescriptor,
    pub texture: Texture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilView {
    pub descriptor: CpuDescriptor,
    pub texture: Texture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderResourceView {
    pub descriptor: CpuDescriptor,
    pub resource: Tracked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnorderedAccessView {
    pub descriptor: CpuDescriptor,
    pub resource: Tracked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConstantBufferView {
    pub descriptor: CpuDescriptor,
    pub buffer: Buffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sampler {
    pub descriptor: CpuDescriptor,
}
