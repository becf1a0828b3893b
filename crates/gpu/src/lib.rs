//! State-tracking immediate-mode GPU context over explicit graphics APIs
//!
//! ## Goals
//!
//! - [x] Redundant state changes never reach the command list
//! - [x] Multiple frames in flight without stalling or corrupting GPU work
//! - [x] Resource state transitions inferred from bindings
//! - [x] Pipeline objects compiled at most once per state combination
//!
//! ## Non-goals
//!
//! - [ ] Shader compilation or reflection (programs are loaded from compiled
//!   cache entries)
//! - [ ] Scene, material, or mesh management

pub mod backend;
pub mod commands;
pub mod constant_buffer;
pub mod context;
pub mod deletion;
pub mod device;
pub mod layout;
pub mod memory;
pub mod output;
pub mod pipeline_cache;
pub mod resource;
pub mod shader;
pub mod state_tracker;
pub mod types;

pub use backend::{recording::RecordingBackend, Backend};
pub use constant_buffer::ConstantBufferKind;
pub use context::{ClearState, ImmediateContext};
pub use device::Device;
pub use output::{OutputBuffer, OutputBufferDesc, VSyncMode};
pub use pipeline_cache::PipelineStateKey;
pub use resource::*;
pub use shader::{ShaderCacheEntry, ShaderProgram};
pub use types::*;

#[cfg(target_os = "windows")]
pub use backend::dx12::Dx12Backend;

use types::VertexSemantic;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A native API call failed. `code` is the native result code (an
    /// `HRESULT` on Direct3D 12).
    #[error("{call} failed with {code:#010x}")]
    Backend { call: &'static str, code: i32 },
    #[error(transparent)]
    Memory(#[from] memory::Error),
    #[error("allocation of {requested} exceeds the configured maximum of {maximum}")]
    AllocationTooLarge { requested: u64, maximum: u64 },
    #[error("invalid shader cache entry: {0}")]
    InvalidShaderCache(#[from] shader::BlobError),
    #[error("shader input {semantic:?}{index} has no matching vertex element")]
    UnmatchedVertexAttribute { semantic: VertexSemantic, index: u32 },
    #[error("constant buffer `{0}` is not registered")]
    UnknownConstantBuffer(String),
    #[error("write of {size} bytes at {offset} overruns a buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        capacity: usize,
    },
    #[error("pipeline compilation failed: {0}")]
    PipelineCompilation(String),
    #[error("window handle is not supported by this backend")]
    UnsupportedWindow,
    #[error("handle does not refer to a live object")]
    InvalidHandle,
    #[error("the device already has an active context")]
    ContextInUse,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PowerPreference {
    #[default]
    LowPower,
    HighPerformance,
}

/// Options for creating a native backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackendConfig {
    /// The power preference for adapter selection.
    ///
    /// This influences the GPU selection criteria in multi-gpu systems. Setting
    /// `LowPower` mode prefers integrated GPUs over discrete GPUs, and setting
    /// `HighPerformance` does the reverse. Defaults to `LowPower`.
    pub power_preference: PowerPreference,

    /// Whether or not to enable debugging features.
    ///
    /// This may have an outsized impact on performance. Defaults to `None`,
    /// which automatically enables debugging features in debug builds. Override
    /// with `Some(true)` or `Some(false)` to force enable or disable debugging.
    pub debug_mode: Option<bool>,
}

impl BackendConfig {
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug_mode.unwrap_or(cfg!(debug_assertions))
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// The number of frames the CPU may record ahead of the GPU.
    ///
    /// Contexts keep one more frame slot than this, so that a slot is always
    /// available for recording while `frame_latency` frames execute. Defaults
    /// to 2.
    pub frame_latency: u32,

    /// The initial size of each frame slot's scratch buffer, used for
    /// constant uploads and user-pointer vertex data.
    ///
    /// Defaults to 16 MiB.
    pub scratch_buffer_size: u64,

    /// The size a scratch buffer may grow to. Larger single requests fail.
    ///
    /// Defaults to 256 MiB.
    pub max_scratch_buffer_size: u64,

    /// The initial number of entries in each frame slot's shader-visible view
    /// heap.
    ///
    /// Defaults to 16384.
    pub scratch_view_descriptors: u32,

    /// Defaults to 1,000,000, the Direct3D 12 tier 1 limit.
    pub max_scratch_view_descriptors: u32,

    /// The initial number of entries in each frame slot's sampler heap.
    ///
    /// Defaults to 1024.
    pub scratch_sampler_descriptors: u32,

    /// Defaults to 2048, the Direct3D 12 limit for shader-visible sampler
    /// heaps.
    pub max_scratch_sampler_descriptors: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_latency: 2,
            scratch_buffer_size: 16 * 1024 * 1024,
            max_scratch_buffer_size: 256 * 1024 * 1024,
            scratch_view_descriptors: 16384,
            max_scratch_view_descriptors: 1_000_000,
            scratch_sampler_descriptors: 1024,
            max_scratch_sampler_descriptors: 2048,
        }
    }
}

impl Config {
    /// The number of frame slots a context cycles through.
    #[must_use]
    pub fn frame_slots(&self) -> usize {
        self.frame_latency.max(1) as usize + 1
    }
}
