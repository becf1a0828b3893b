use windows::Win32::Graphics::{Direct3D::ID3DBlob, Direct3D12::*};

use crate::{
    layout::{
        self, Pipe, COMPUTE_PARAMETER_COUNT, GRAPHICS_PARAMETER_COUNT,
        PER_DRAW_CONSTANT_BUFFER_SLOTS, TABLE_CONSTANT_BUFFER_SLOTS,
    },
    types::{BindingFamily, ShaderStage},
    Error,
};

use super::Check;

pub struct RootSignatures {
    pub graphics: ID3D12RootSignature,
    pub compute: ID3D12RootSignature,
}

impl RootSignatures {
    pub fn new(device: &ID3D12Device) -> Result<Self, Error> {
        Ok(Self {
            graphics: create(device, Pipe::Graphics)?,
            compute: create(device, Pipe::Compute)?,
        })
    }
}

fn visibility(stage: ShaderStage) -> D3D12_SHADER_VISIBILITY {
    match stage {
        ShaderStage::Vertex => D3D12_SHADER_VISIBILITY_VERTEX,
        ShaderStage::Hull => D3D12_SHADER_VISIBILITY_HULL,
        ShaderStage::Domain => D3D12_SHADER_VISIBILITY_DOMAIN,
        ShaderStage::Geometry => D3D12_SHADER_VISIBILITY_GEOMETRY,
        ShaderStage::Pixel => D3D12_SHADER_VISIBILITY_PIXEL,
        ShaderStage::Compute => D3D12_SHADER_VISIBILITY_ALL,
    }
}

fn range(family: BindingFamily) -> D3D12_DESCRIPTOR_RANGE {
    D3D12_DESCRIPTOR_RANGE {
        RangeType: match family {
            BindingFamily::ConstantBuffer => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
            BindingFamily::ShaderResource => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
            BindingFamily::Sampler => D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
            BindingFamily::UnorderedAccess => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
        },
        NumDescriptors: family.slot_count() as u32,
        BaseShaderRegister: 0,
        RegisterSpace: 0,
        OffsetInDescriptorsFromTableStart: 0,
    }
}

/// Lists the tables of a root signature as `(parameter, stage, family)`,
/// in parameter order.
fn tables(pipe: Pipe) -> Vec<(u32, ShaderStage, BindingFamily)> {
    let stages: &[ShaderStage] = match pipe {
        Pipe::Graphics => &ShaderStage::GRAPHICS,
        Pipe::Compute => &[ShaderStage::Compute],
    };

    let mut tables: Vec<_> = stages
        .iter()
        .flat_map(|&stage| {
            BindingFamily::ALL.into_iter().filter_map(move |family| {
                layout::table_parameter(stage, family).map(|parameter| (parameter, stage, family))
            })
        })
        .collect();

    tables.sort_by_key(|(parameter, ..)| *parameter);
    tables
}

fn create(device: &ID3D12Device, pipe: Pipe) -> Result<ID3D12RootSignature, Error> {
    let tables = tables(pipe);

    // One range per table. Filled completely before any parameter points
    // into it.
    let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = tables
        .iter()
        .map(|&(_, _, family)| range(family))
        .collect();

    let mut parameters: Vec<D3D12_ROOT_PARAMETER> = tables
        .iter()
        .zip(&ranges)
        .map(|(&(_, stage, _), range)| D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: range,
                },
            },
            ShaderVisibility: visibility(stage),
        })
        .collect();

    for slot in 0..PER_DRAW_CONSTANT_BUFFER_SLOTS {
        debug_assert_eq!(
            parameters.len() as u32,
            layout::per_draw_parameter(pipe, slot)
        );
        parameters.push(D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                Descriptor: D3D12_ROOT_DESCRIPTOR {
                    ShaderRegister: TABLE_CONSTANT_BUFFER_SLOTS + slot,
                    RegisterSpace: 0,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        });
    }

    debug_assert_eq!(
        parameters.len() as u32,
        match pipe {
            Pipe::Graphics => GRAPHICS_PARAMETER_COUNT,
            Pipe::Compute => COMPUTE_PARAMETER_COUNT,
        }
    );

    let desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 0,
        pStaticSamplers: std::ptr::null(),
        Flags: match pipe {
            Pipe::Graphics => D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
            Pipe::Compute => D3D12_ROOT_SIGNATURE_FLAG_NONE,
        },
    };

    let mut blob: Option<ID3DBlob> = None;
    let mut error: Option<ID3DBlob> = None;
    let serialized = unsafe {
        D3D12SerializeRootSignature(
            &desc,
            D3D_ROOT_SIGNATURE_VERSION_1,
            &mut blob,
            Some(&mut error),
        )
    };

    if let Err(e) = serialized {
        if let Some(error) = error {
            log::error!("root signature serialization failed: {}", unsafe {
                String::from_utf8_lossy(blob_bytes(&error))
            });
        }
        return Err(Error::Backend {
            call: "D3D12SerializeRootSignature",
            code: e.code().0,
        });
    }

    let blob = blob.ok_or(Error::Backend {
        call: "D3D12SerializeRootSignature",
        code: 0,
    })?;

    unsafe { device.CreateRootSignature(0, blob_bytes(&blob)) }.check("CreateRootSignature")
}

/// # Safety
///
/// The blob must outlive the returned slice.
unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer().cast::<u8>(), blob.GetBufferSize())
}
