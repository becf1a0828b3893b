//! Translation of portable state descriptions into their native forms.

use windows::Win32::Graphics::{
    Direct3D::*,
    Direct3D12::*,
    Dxgi::Common::*,
};

use crate::types::{
    AddressMode, Blend, BlendDesc, BlendOp, ComparisonFunc, CullMode, DepthStencilDesc, FillMode,
    Filter, PixelFormat, PrimitiveTopology, RasterizerDesc, ResourceState, SamplerDesc,
    StencilFaceDesc, StencilOp, TopologyType, VertexFormat, MAX_RENDER_TARGETS,
};

pub fn pixel_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Unknown => DXGI_FORMAT_UNKNOWN,
        PixelFormat::R8G8B8A8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        PixelFormat::R8G8B8A8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        PixelFormat::B8G8R8A8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        PixelFormat::R10G10B10A2Unorm => DXGI_FORMAT_R10G10B10A2_UNORM,
        PixelFormat::R16G16B16A16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        PixelFormat::R32G32B32A32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        PixelFormat::R32Float => DXGI_FORMAT_R32_FLOAT,
        PixelFormat::R16Float => DXGI_FORMAT_R16_FLOAT,
        PixelFormat::R8Unorm => DXGI_FORMAT_R8_UNORM,
        PixelFormat::D16Unorm => DXGI_FORMAT_D16_UNORM,
        PixelFormat::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        PixelFormat::D32Float => DXGI_FORMAT_D32_FLOAT,
    }
}

/// The format a depth texture is allocated with, so that it can be viewed
/// both as a depth buffer and as a shader resource.
pub fn typeless_depth_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::D16Unorm => DXGI_FORMAT_R16_TYPELESS,
        PixelFormat::D24UnormS8Uint => DXGI_FORMAT_R24G8_TYPELESS,
        PixelFormat::D32Float => DXGI_FORMAT_R32_TYPELESS,
        other => pixel_format(other),
    }
}

/// The format a shader sees when reading a depth texture.
pub fn depth_read_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::D16Unorm => DXGI_FORMAT_R16_UNORM,
        PixelFormat::D24UnormS8Uint => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        PixelFormat::D32Float => DXGI_FORMAT_R32_FLOAT,
        other => pixel_format(other),
    }
}

pub fn vertex_format(format: VertexFormat) -> DXGI_FORMAT {
    match format {
        VertexFormat::Float => DXGI_FORMAT_R32_FLOAT,
        VertexFormat::Float2 => DXGI_FORMAT_R32G32_FLOAT,
        VertexFormat::Float3 => DXGI_FORMAT_R32G32B32_FLOAT,
        VertexFormat::Float4 => DXGI_FORMAT_R32G32B32A32_FLOAT,
        VertexFormat::UByte4 => DXGI_FORMAT_R8G8B8A8_UINT,
        VertexFormat::UByte4Norm => DXGI_FORMAT_R8G8B8A8_UNORM,
        VertexFormat::Half2 => DXGI_FORMAT_R16G16_FLOAT,
        VertexFormat::Half4 => DXGI_FORMAT_R16G16B16A16_FLOAT,
        VertexFormat::Uint => DXGI_FORMAT_R32_UINT,
        VertexFormat::Uint4 => DXGI_FORMAT_R32G32B32A32_UINT,
    }
}

pub fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common | ResourceState::Present => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::VertexAndConstantBuffer => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::DepthRead => D3D12_RESOURCE_STATE_DEPTH_READ,
        ResourceState::ShaderResource => {
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
                | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE
        }
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
    }
}

pub fn primitive_topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveTopology::LineStrip => D3D_PRIMITIVE_TOPOLOGY_LINESTRIP,
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
        PrimitiveTopology::PatchList { control_points } => {
            let points = i32::from(control_points.clamp(1, 32));
            D3D_PRIMITIVE_TOPOLOGY(D3D_PRIMITIVE_TOPOLOGY_1_CONTROL_POINT_PATCHLIST.0 + points - 1)
        }
    }
}

pub fn topology_type(kind: TopologyType) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match kind {
        TopologyType::Undefined => D3D12_PRIMITIVE_TOPOLOGY_TYPE_UNDEFINED,
        TopologyType::Point => D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        TopologyType::Line => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        TopologyType::Triangle => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
        TopologyType::Patch => D3D12_PRIMITIVE_TOPOLOGY_TYPE_PATCH,
    }
}

pub fn rasterizer(desc: &RasterizerDesc) -> D3D12_RASTERIZER_DESC {
    D3D12_RASTERIZER_DESC {
        FillMode: match desc.fill_mode {
            FillMode::Solid => D3D12_FILL_MODE_SOLID,
            FillMode::Wireframe => D3D12_FILL_MODE_WIREFRAME,
        },
        CullMode: match desc.cull_mode {
            CullMode::None => D3D12_CULL_MODE_NONE,
            CullMode::Front => D3D12_CULL_MODE_FRONT,
            CullMode::Back => D3D12_CULL_MODE_BACK,
        },
        FrontCounterClockwise: desc.front_counter_clockwise.into(),
        DepthBias: desc.depth_bias,
        DepthBiasClamp: desc.depth_bias_clamp,
        SlopeScaledDepthBias: desc.slope_scaled_depth_bias,
        DepthClipEnable: desc.depth_clip_enable.into(),
        MultisampleEnable: desc.multisample_enable.into(),
        AntialiasedLineEnable: desc.antialiased_line_enable.into(),
        ForcedSampleCount: 0,
        ConservativeRaster: D3D12_CONSERVATIVE_RASTERIZATION_MODE_OFF,
    }
}

pub fn comparison(func: ComparisonFunc) -> D3D12_COMPARISON_FUNC {
    match func {
        ComparisonFunc::Never => D3D12_COMPARISON_FUNC_NEVER,
        ComparisonFunc::Less => D3D12_COMPARISON_FUNC_LESS,
        ComparisonFunc::Equal => D3D12_COMPARISON_FUNC_EQUAL,
        ComparisonFunc::LessEqual => D3D12_COMPARISON_FUNC_LESS_EQUAL,
        ComparisonFunc::Greater => D3D12_COMPARISON_FUNC_GREATER,
        ComparisonFunc::NotEqual => D3D12_COMPARISON_FUNC_NOT_EQUAL,
        ComparisonFunc::GreaterEqual => D3D12_COMPARISON_FUNC_GREATER_EQUAL,
        ComparisonFunc::Always => D3D12_COMPARISON_FUNC_ALWAYS,
    }
}

fn stencil_op(op: StencilOp) -> D3D12_STENCIL_OP {
    match op {
        StencilOp::Keep => D3D12_STENCIL_OP_KEEP,
        StencilOp::Zero => D3D12_STENCIL_OP_ZERO,
        StencilOp::Replace => D3D12_STENCIL_OP_REPLACE,
        StencilOp::IncrementSaturate => D3D12_STENCIL_OP_INCR_SAT,
        StencilOp::DecrementSaturate => D3D12_STENCIL_OP_DECR_SAT,
        StencilOp::Invert => D3D12_STENCIL_OP_INVERT,
        StencilOp::Increment => D3D12_STENCIL_OP_INCR,
        StencilOp::Decrement => D3D12_STENCIL_OP_DECR,
    }
}

fn stencil_face(face: &StencilFaceDesc) -> D3D12_DEPTH_STENCILOP_DESC {
    D3D12_DEPTH_STENCILOP_DESC {
        StencilFailOp: stencil_op(face.fail_op),
        StencilDepthFailOp: stencil_op(face.depth_fail_op),
        StencilPassOp: stencil_op(face.pass_op),
        StencilFunc: comparison(face.func),
    }
}

pub fn depth_stencil(desc: &DepthStencilDesc) -> D3D12_DEPTH_STENCIL_DESC {
    D3D12_DEPTH_STENCIL_DESC {
        DepthEnable: desc.depth_enable.into(),
        DepthWriteMask: if desc.depth_write {
            D3D12_DEPTH_WRITE_MASK_ALL
        } else {
            D3D12_DEPTH_WRITE_MASK_ZERO
        },
        DepthFunc: comparison(desc.depth_func),
        StencilEnable: desc.stencil_enable.into(),
        StencilReadMask: desc.stencil_read_mask,
        StencilWriteMask: desc.stencil_write_mask,
        FrontFace: stencil_face(&desc.front_face),
        BackFace: stencil_face(&desc.back_face),
    }
}

fn blend_factor(blend: Blend) -> D3D12_BLEND {
    match blend {
        Blend::Zero => D3D12_BLEND_ZERO,
        Blend::One => D3D12_BLEND_ONE,
        Blend::SrcColor => D3D12_BLEND_SRC_COLOR,
        Blend::InvSrcColor => D3D12_BLEND_INV_SRC_COLOR,
        Blend::SrcAlpha => D3D12_BLEND_SRC_ALPHA,
        Blend::InvSrcAlpha => D3D12_BLEND_INV_SRC_ALPHA,
        Blend::DestAlpha => D3D12_BLEND_DEST_ALPHA,
        Blend::InvDestAlpha => D3D12_BLEND_INV_DEST_ALPHA,
        Blend::DestColor => D3D12_BLEND_DEST_COLOR,
        Blend::InvDestColor => D3D12_BLEND_INV_DEST_COLOR,
        Blend::SrcAlphaSat => D3D12_BLEND_SRC_ALPHA_SAT,
        Blend::BlendFactor => D3D12_BLEND_BLEND_FACTOR,
        Blend::InvBlendFactor => D3D12_BLEND_INV_BLEND_FACTOR,
    }
}

fn blend_op(op: BlendOp) -> D3D12_BLEND_OP {
    match op {
        BlendOp::Add => D3D12_BLEND_OP_ADD,
        BlendOp::Subtract => D3D12_BLEND_OP_SUBTRACT,
        BlendOp::RevSubtract => D3D12_BLEND_OP_REV_SUBTRACT,
        BlendOp::Min => D3D12_BLEND_OP_MIN,
        BlendOp::Max => D3D12_BLEND_OP_MAX,
    }
}

pub fn blend(desc: &BlendDesc) -> D3D12_BLEND_DESC {
    let mut targets = [D3D12_RENDER_TARGET_BLEND_DESC::default(); MAX_RENDER_TARGETS];
    for (target, desc) in targets.iter_mut().zip(&desc.render_targets) {
        *target = D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: desc.blend_enable.into(),
            LogicOpEnable: false.into(),
            SrcBlend: blend_factor(desc.src_blend),
            DestBlend: blend_factor(desc.dest_blend),
            BlendOp: blend_op(desc.blend_op),
            SrcBlendAlpha: blend_factor(desc.src_blend_alpha),
            DestBlendAlpha: blend_factor(desc.dest_blend_alpha),
            BlendOpAlpha: blend_op(desc.blend_op_alpha),
            LogicOp: D3D12_LOGIC_OP_NOOP,
            RenderTargetWriteMask: desc.write_mask & D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
        };
    }

    D3D12_BLEND_DESC {
        AlphaToCoverageEnable: desc.alpha_to_coverage.into(),
        IndependentBlendEnable: desc.independent_blend.into(),
        RenderTarget: targets,
    }
}

fn address_mode(mode: AddressMode) -> D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        AddressMode::Wrap => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::Mirror => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::Clamp => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressMode::Border => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

pub fn sampler(desc: &SamplerDesc) -> D3D12_SAMPLER_DESC {
    let filter = match (desc.filter, desc.comparison.is_some()) {
        (Filter::Point, false) => D3D12_FILTER_MIN_MAG_MIP_POINT,
        (Filter::Linear, false) => D3D12_FILTER_MIN_MAG_MIP_LINEAR,
        (Filter::Anisotropic, false) => D3D12_FILTER_ANISOTROPIC,
        (Filter::Point, true) => D3D12_FILTER_COMPARISON_MIN_MAG_MIP_POINT,
        (Filter::Linear, true) => D3D12_FILTER_COMPARISON_MIN_MAG_MIP_LINEAR,
        (Filter::Anisotropic, true) => D3D12_FILTER_COMPARISON_ANISOTROPIC,
    };

    D3D12_SAMPLER_DESC {
        Filter: filter,
        AddressU: address_mode(desc.address_u),
        AddressV: address_mode(desc.address_v),
        AddressW: address_mode(desc.address_w),
        MipLODBias: desc.mip_lod_bias,
        MaxAnisotropy: desc.max_anisotropy.clamp(1, 16),
        ComparisonFunc: comparison(desc.comparison.unwrap_or(ComparisonFunc::Never)),
        BorderColor: desc.border_color,
        MinLOD: desc.min_lod,
        MaxLOD: desc.max_lod,
    }
}
