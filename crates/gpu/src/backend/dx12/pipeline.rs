use windows::{
    core::PCSTR,
    s,
    Win32::Graphics::{Direct3D12::*, Dxgi::Common::*},
};

use crate::{
    backend::PipelineDesc,
    types::{ShaderStage, VertexElementDesc, VertexSemantic, MAX_RENDER_TARGETS},
    Error,
};

use super::{borrowed, convert, root_signature::RootSignatures};

fn semantic_name(semantic: VertexSemantic) -> PCSTR {
    match semantic {
        VertexSemantic::Position => s!("POSITION"),
        VertexSemantic::Normal => s!("NORMAL"),
        VertexSemantic::Tangent => s!("TANGENT"),
        VertexSemantic::Binormal => s!("BINORMAL"),
        VertexSemantic::Color => s!("COLOR"),
        VertexSemantic::TexCoord => s!("TEXCOORD"),
        VertexSemantic::BlendIndices => s!("BLENDINDICES"),
        VertexSemantic::BlendWeights => s!("BLENDWEIGHT"),
    }
}

fn input_element(element: &VertexElementDesc) -> D3D12_INPUT_ELEMENT_DESC {
    let per_instance = element.instance_step_rate > 0;

    D3D12_INPUT_ELEMENT_DESC {
        SemanticName: semantic_name(element.semantic),
        SemanticIndex: element.semantic_index,
        Format: convert::vertex_format(element.format),
        InputSlot: element.stream_index,
        AlignedByteOffset: element.stream_offset,
        InputSlotClass: if per_instance {
            D3D12_INPUT_CLASSIFICATION_PER_INSTANCE_DATA
        } else {
            D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA
        },
        InstanceDataStepRate: element.instance_step_rate,
    }
}

fn bytecode(code: &[u8]) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: if code.is_empty() {
            std::ptr::null()
        } else {
            code.as_ptr().cast()
        },
        BytecodeLength: code.len(),
    }
}

pub fn create(
    device: &ID3D12Device,
    roots: &RootSignatures,
    desc: &PipelineDesc,
) -> Result<ID3D12PipelineState, Error> {
    let result = if desc.is_compute() {
        let info = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: borrowed(&roots.compute),
            CS: bytecode(desc.stages[ShaderStage::Compute.index()]),
            NodeMask: 0,
            Flags: D3D12_PIPELINE_STATE_FLAG_NONE,
            ..Default::default()
        };

        unsafe { device.CreateComputePipelineState(&info) }
    } else {
        let key = desc.key;
        let input_elements: Vec<_> = desc.vertex_elements.iter().map(input_element).collect();

        let mut render_target_formats = [DXGI_FORMAT_UNKNOWN; MAX_RENDER_TARGETS];
        let count = (key.render_target_count as usize).min(MAX_RENDER_TARGETS);
        for (native, format) in render_target_formats
            .iter_mut()
            .zip(&key.render_target_formats[..count])
        {
            *native = convert::pixel_format(*format);
        }

        let stage = |stage: ShaderStage| bytecode(desc.stages[stage.index()]);

        let info = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: borrowed(&roots.graphics),
            VS: stage(ShaderStage::Vertex),
            PS: stage(ShaderStage::Pixel),
            DS: stage(ShaderStage::Domain),
            HS: stage(ShaderStage::Hull),
            GS: stage(ShaderStage::Geometry),
            BlendState: convert::blend(&key.blend),
            SampleMask: u32::MAX,
            RasterizerState: convert::rasterizer(&key.rasterizer),
            DepthStencilState: convert::depth_stencil(&key.depth_stencil),
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: if input_elements.is_empty() {
                    std::ptr::null()
                } else {
                    input_elements.as_ptr()
                },
                NumElements: input_elements.len() as u32,
            },
            PrimitiveTopologyType: convert::topology_type(key.topology_type),
            NumRenderTargets: count as u32,
            RTVFormats: render_target_formats,
            DSVFormat: convert::pixel_format(key.depth_stencil_format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            NodeMask: 0,
            Flags: D3D12_PIPELINE_STATE_FLAG_NONE,
            ..Default::default()
        };

        unsafe { device.CreateGraphicsPipelineState(&info) }
    };

    result.map_err(|e| {
        log::error!("pipeline creation failed: {}", e.message());
        Error::PipelineCompilation(e.message().to_string())
    })
}
