//! Plain-data descriptions of fixed-function state, formats and stages.
//!
//! Everything here is backend-agnostic. Backends translate these into their
//! native structures at the lowest layer.

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_VERTEX_BUFFERS: usize = 16;
pub const STAGE_COUNT: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ShaderStage {
    Vertex = 0,
    Hull = 1,
    Domain = 2,
    Geometry = 3,
    Pixel = 4,
    Compute = 5,
}

impl ShaderStage {
    pub const ALL: [Self; STAGE_COUNT] = [
        Self::Vertex,
        Self::Hull,
        Self::Domain,
        Self::Geometry,
        Self::Pixel,
        Self::Compute,
    ];

    pub const GRAPHICS: [Self; 5] = [
        Self::Vertex,
        Self::Hull,
        Self::Domain,
        Self::Geometry,
        Self::Pixel,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// The four kinds of per-stage bindings. Each is staged into its own
/// descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingFamily {
    ConstantBuffer,
    ShaderResource,
    Sampler,
    UnorderedAccess,
}

impl BindingFamily {
    pub const ALL: [Self; 4] = [
        Self::ConstantBuffer,
        Self::ShaderResource,
        Self::Sampler,
        Self::UnorderedAccess,
    ];

    /// The number of table slots available to a single stage. Constant
    /// buffers bound past the table are per-draw root constant buffers.
    #[must_use]
    pub fn slot_count(self) -> usize {
        match self {
            Self::ConstantBuffer => crate::layout::TABLE_CONSTANT_BUFFER_SLOTS as usize,
            Self::ShaderResource => 128,
            Self::Sampler => 16,
            Self::UnorderedAccess => 8,
        }
    }

    #[must_use]
    pub fn heap_kind(self) -> DescriptorHeapKind {
        match self {
            Self::Sampler => DescriptorHeapKind::Sampler,
            _ => DescriptorHeapKind::View,
        }
    }
}

/// Shader-visible descriptor heaps come in two flavors: views (CBV/SRV/UAV)
/// and samplers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    View,
    Sampler,
}

/// The usage state of a GPU resource. Transitions between these must be
/// recorded as barriers before the resource is used in its new role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    ShaderResource,
    CopyDest,
    CopySource,
    Present,
    GenericRead,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    #[default]
    Unknown = 0,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    R10G10B10A2Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32Float,
    R16Float,
    R8Unorm,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
}

impl PixelFormat {
    #[must_use]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D16Unorm | Self::D24UnormS8Uint | Self::D32Float)
    }

    #[must_use]
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::R8Unorm => 1,
            Self::R16Float | Self::D16Unorm => 2,
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8UnormSrgb
            | Self::B8G8R8A8Unorm
            | Self::R10G10B10A2Unorm
            | Self::R32Float
            | Self::D24UnormS8Uint
            | Self::D32Float => 4,
            Self::R16G16B16A16Float => 8,
            Self::R32G32B32A32Float => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    PatchList { control_points: u8 },
}

/// The coarse class of a topology. Only this, not the full topology, is
/// baked into a pipeline object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TopologyType {
    #[default]
    Undefined = 0,
    Point,
    Line,
    Triangle,
    Patch,
}

impl PrimitiveTopology {
    #[must_use]
    pub fn topology_type(self) -> TopologyType {
        match self {
            Self::PointList => TopologyType::Point,
            Self::LineList | Self::LineStrip => TopologyType::Line,
            Self::TriangleList | Self::TriangleStrip => TopologyType::Triangle,
            Self::PatchList { .. } => TopologyType::Patch,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip_enable: bool,
    pub multisample_enable: bool,
    pub antialiased_line_enable: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_bias: 0,
            depth_bias_clamp: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_clip_enable: true,
            multisample_enable: false,
            antialiased_line_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementSaturate,
    DecrementSaturate,
    Invert,
    Increment,
    Decrement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilFaceDesc {
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub func: ComparisonFunc,
}

impl Default for StencilFaceDesc {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            func: ComparisonFunc::Always,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front_face: StencilFaceDesc,
    pub back_face: StencilFaceDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write: true,
            depth_func: ComparisonFunc::Less,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front_face: StencilFaceDesc::default(),
            back_face: StencilFaceDesc::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Blend {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
    SrcAlphaSat,
    BlendFactor,
    InvBlendFactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlendOp {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetBlendDesc {
    pub blend_enable: bool,
    pub src_blend: Blend,
    pub dest_blend: Blend,
    pub blend_op: BlendOp,
    pub src_blend_alpha: Blend,
    pub dest_blend_alpha: Blend,
    pub blend_op_alpha: BlendOp,
    pub write_mask: u8,
}

impl Default for RenderTargetBlendDesc {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_blend: Blend::One,
            dest_blend: Blend::Zero,
            blend_op: BlendOp::Add,
            src_blend_alpha: Blend::One,
            dest_blend_alpha: Blend::Zero,
            blend_op_alpha: BlendOp::Add,
            write_mask: 0x0f,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlendDesc {
    pub alpha_to_coverage: bool,
    pub independent_blend: bool,
    pub render_targets: [RenderTargetBlendDesc; MAX_RENDER_TARGETS],
}

impl BlendDesc {
    /// Straight alpha blending on every target.
    #[must_use]
    pub fn alpha_blend() -> Self {
        let target = RenderTargetBlendDesc {
            blend_enable: true,
            src_blend: Blend::SrcAlpha,
            dest_blend: Blend::InvSrcAlpha,
            ..RenderTargetBlendDesc::default()
        };

        Self {
            render_targets: [target; MAX_RENDER_TARGETS],
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Point,
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison: Option<ComparisonFunc>,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_u: AddressMode::Clamp,
            address_v: AddressMode::Clamp,
            address_w: AddressMode::Clamp,
            mip_lod_bias: 0.0,
            max_anisotropy: 1,
            comparison: None,
            border_color: [0.0; 4],
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

/// Semantic of a vertex attribute, as named in shader input signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VertexSemantic {
    Position = 0,
    Normal,
    Tangent,
    Binormal,
    Color,
    TexCoord,
    BlendIndices,
    BlendWeights,
}

impl VertexSemantic {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Position,
            1 => Self::Normal,
            2 => Self::Tangent,
            3 => Self::Binormal,
            4 => Self::Color,
            5 => Self::TexCoord,
            6 => Self::BlendIndices,
            7 => Self::BlendWeights,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Position => "POSITION",
            Self::Normal => "NORMAL",
            Self::Tangent => "TANGENT",
            Self::Binormal => "BINORMAL",
            Self::Color => "COLOR",
            Self::TexCoord => "TEXCOORD",
            Self::BlendIndices => "BLENDINDICES",
            Self::BlendWeights => "BLENDWEIGHT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    UByte4,
    UByte4Norm,
    Half2,
    Half4,
    Uint,
    Uint4,
}

/// Describes where one vertex attribute is found in the bound vertex
/// streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexElementDesc {
    pub semantic: VertexSemantic,
    pub semantic_index: u32,
    pub format: VertexFormat,
    pub stream_index: u32,
    pub stream_offset: u32,
    /// Zero for per-vertex data.
    pub instance_step_rate: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_types() {
        assert_eq!(
            PrimitiveTopology::TriangleList.topology_type(),
            PrimitiveTopology::TriangleStrip.topology_type()
        );
        assert_ne!(
            PrimitiveTopology::LineList.topology_type(),
            PrimitiveTopology::TriangleList.topology_type()
        );
    }

    #[test]
    fn binding_family_heaps() {
        assert_eq!(BindingFamily::Sampler.heap_kind(), DescriptorHeapKind::Sampler);
        assert_eq!(BindingFamily::ConstantBuffer.heap_kind(), DescriptorHeapKind::View);
        assert_eq!(BindingFamily::UnorderedAccess.heap_kind(), DescriptorHeapKind::View);
    }
}
