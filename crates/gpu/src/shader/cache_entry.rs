//! The compiled-shader blob produced by the offline shader compiler.
//!
//! Layout, all little-endian and fixed width:
//!
//! ```text
//! Header
//! stage bytecode, for each stage with a non-zero size, in stage order
//! VertexAttributeRecord * vertex_attribute_count
//! ConstantBufferRecord  * constant_buffer_count
//! ParameterRecord       * parameter_count
//! ```
//!
//! Anything that does not parse exactly is rejected as a whole.

use bytemuck::{Pod, Zeroable};

use crate::types::{VertexSemantic, STAGE_COUNT};

pub const SIGNATURE: u32 = u32::from_le_bytes(*b"SCE\0");
pub const VERSION: u8 = 1;
pub const NAME_LENGTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("shader cache entry is truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("shader cache entry has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("bad shader cache entry signature {0:#010x}")]
    BadSignature(u32),
    #[error("unsupported shader cache entry version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid value {value} for {field}")]
    InvalidEnum { field: &'static str, value: i64 },
    #[error("{field} index {index} is out of range ({count} entries)")]
    IndexOutOfRange {
        field: &'static str,
        index: i64,
        count: usize,
    },
    #[error("name is not valid UTF-8")]
    InvalidName,
    #[error("name `{0}` does not fit in {NAME_LENGTH} bytes")]
    NameTooLong(String),
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Header {
    signature: u32,
    version: u8,
    reserved: [u8; 3],
    feature_level: u32,
    stage_size: [u32; STAGE_COUNT],
    vertex_attribute_count: u32,
    constant_buffer_count: u32,
    parameter_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct VertexAttributeRecord {
    semantic: u32,
    semantic_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ConstantBufferRecord {
    name: [u8; NAME_LENGTH],
    size: u32,
    parameter_index: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ParameterRecord {
    name: [u8; NAME_LENGTH],
    ty: u32,
    constant_buffer_index: i32,
    constant_buffer_offset: u32,
    array_size: u32,
    array_stride: u32,
    bind_target: u32,
    bind_point: [i32; STAGE_COUNT],
    linked_sampler_index: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ParameterType {
    Bool = 0,
    Int,
    Int2,
    Int3,
    Int4,
    Uint,
    Uint2,
    Uint3,
    Uint4,
    Float,
    Float2,
    Float3,
    Float4,
    Float2x2,
    Float3x3,
    Float3x4,
    Float4x4,
    Struct,
    ConstantBuffer,
    Texture,
    Buffer,
    SamplerState,
}

impl ParameterType {
    const ALL: [Self; 22] = [
        Self::Bool,
        Self::Int,
        Self::Int2,
        Self::Int3,
        Self::Int4,
        Self::Uint,
        Self::Uint2,
        Self::Uint3,
        Self::Uint4,
        Self::Float,
        Self::Float2,
        Self::Float3,
        Self::Float4,
        Self::Float2x2,
        Self::Float3x3,
        Self::Float3x4,
        Self::Float4x4,
        Self::Struct,
        Self::ConstantBuffer,
        Self::Texture,
        Self::Buffer,
        Self::SamplerState,
    ];

    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// The size in bytes of one value stored in a constant buffer, or zero
    /// for types that are not stored in constant buffers.
    #[must_use]
    pub fn value_size(self) -> u32 {
        match self {
            Self::Bool | Self::Int | Self::Uint | Self::Float => 4,
            Self::Int2 | Self::Uint2 | Self::Float2 => 8,
            Self::Int3 | Self::Uint3 | Self::Float3 => 12,
            Self::Int4 | Self::Uint4 | Self::Float4 | Self::Float2x2 => 16,
            Self::Float3x3 => 36,
            Self::Float3x4 => 48,
            Self::Float4x4 => 64,
            Self::Struct
            | Self::ConstantBuffer
            | Self::Texture
            | Self::Buffer
            | Self::SamplerState => 0,
        }
    }
}

/// What a parameter binds to when set as a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BindTarget {
    None = 0,
    ConstantBuffer,
    Resource,
    Sampler,
    UnorderedAccess,
}

impl BindTarget {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::ConstantBuffer,
            2 => Self::Resource,
            3 => Self::Sampler,
            4 => Self::UnorderedAccess,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub semantic_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantBufferDecl {
    pub name: String,
    pub size: u32,
    /// The parameter describing this buffer's bind points.
    pub parameter_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: ParameterType,
    pub constant_buffer: Option<u32>,
    pub constant_buffer_offset: u32,
    pub array_size: u32,
    pub array_stride: u32,
    pub bind_target: BindTarget,
    /// Register per [`ShaderStage`](crate::ShaderStage) index.
    pub bind_points: [Option<u32>; STAGE_COUNT],
    /// For textures, the parameter of the sampler bound alongside it.
    pub linked_sampler: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderCacheEntry {
    pub feature_level: u32,
    /// Bytecode per stage. Empty for absent stages.
    pub stages: [Vec<u8>; STAGE_COUNT],
    pub vertex_attributes: Vec<VertexAttribute>,
    pub constant_buffers: Vec<ConstantBufferDecl>,
    pub parameters: Vec<Parameter>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], BlobError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(BlobError::Truncated {
                offset: self.offset,
                needed: len,
            })?;

        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn record<T: Pod>(&mut self) -> Result<T, BlobError> {
        self.take(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }
}

fn decode_name(raw: &[u8; NAME_LENGTH]) -> Result<String, BlobError> {
    let len = raw.iter().position(|b| *b == 0).unwrap_or(NAME_LENGTH);
    std::str::from_utf8(&raw[..len])
        .map(str::to_owned)
        .map_err(|_| BlobError::InvalidName)
}

fn encode_name(name: &str) -> Result<[u8; NAME_LENGTH], BlobError> {
    if name.len() >= NAME_LENGTH {
        return Err(BlobError::NameTooLong(name.to_owned()));
    }

    let mut raw = [0; NAME_LENGTH];
    raw[..name.len()].copy_from_slice(name.as_bytes());
    Ok(raw)
}

fn optional_index(field: &'static str, raw: i32, count: usize) -> Result<Option<u32>, BlobError> {
    match raw {
        -1 => Ok(None),
        index if index >= 0 && (index as usize) < count => Ok(Some(index as u32)),
        index => Err(BlobError::IndexOutOfRange {
            field,
            index: i64::from(index),
            count,
        }),
    }
}

fn optional_raw(value: Option<u32>) -> i32 {
    value.map_or(-1, |v| v as i32)
}

impl ShaderCacheEntry {
    pub fn read(bytes: &[u8]) -> Result<Self, BlobError> {
        let mut reader = Reader { bytes, offset: 0 };

        let header: Header = reader.record()?;
        if header.signature != SIGNATURE {
            return Err(BlobError::BadSignature(header.signature));
        }
        if header.version != VERSION {
            return Err(BlobError::UnsupportedVersion(header.version));
        }

        let mut stages: [Vec<u8>; STAGE_COUNT] = Default::default();
        for (stage, size) in stages.iter_mut().zip(header.stage_size) {
            *stage = reader.take(size as usize)?.to_vec();
        }

        let vertex_attributes = (0..header.vertex_attribute_count)
            .map(|_| {
                let record: VertexAttributeRecord = reader.record()?;
                let semantic =
                    VertexSemantic::from_raw(record.semantic).ok_or(BlobError::InvalidEnum {
                        field: "vertex attribute semantic",
                        value: i64::from(record.semantic),
                    })?;
                Ok(VertexAttribute {
                    semantic,
                    semantic_index: record.semantic_index,
                })
            })
            .collect::<Result<Vec<_>, BlobError>>()?;

        let constant_buffer_records = (0..header.constant_buffer_count)
            .map(|_| reader.record::<ConstantBufferRecord>())
            .collect::<Result<Vec<_>, _>>()?;

        let parameter_records = (0..header.parameter_count)
            .map(|_| reader.record::<ParameterRecord>())
            .collect::<Result<Vec<_>, _>>()?;

        let remaining = bytes.len() - reader.offset;
        if remaining != 0 {
            return Err(BlobError::TrailingBytes(remaining));
        }

        let constant_buffer_count = constant_buffer_records.len();
        let parameter_count = parameter_records.len();

        let parameters = parameter_records
            .iter()
            .map(|record| {
                let ty = ParameterType::from_raw(record.ty).ok_or(BlobError::InvalidEnum {
                    field: "parameter type",
                    value: i64::from(record.ty),
                })?;
                let bind_target =
                    BindTarget::from_raw(record.bind_target).ok_or(BlobError::InvalidEnum {
                        field: "parameter bind target",
                        value: i64::from(record.bind_target),
                    })?;

                let mut bind_points = [None; STAGE_COUNT];
                for (point, raw) in bind_points.iter_mut().zip(record.bind_point) {
                    *point = match raw {
                        -1 => None,
                        raw if raw >= 0 => Some(raw as u32),
                        raw => {
                            return Err(BlobError::InvalidEnum {
                                field: "parameter bind point",
                                value: i64::from(raw),
                            })
                        }
                    };
                }

                Ok(Parameter {
                    name: decode_name(&record.name)?,
                    ty,
                    constant_buffer: optional_index(
                        "parameter constant buffer",
                        record.constant_buffer_index,
                        constant_buffer_count,
                    )?,
                    constant_buffer_offset: record.constant_buffer_offset,
                    array_size: record.array_size,
                    array_stride: record.array_stride,
                    bind_target,
                    bind_points,
                    linked_sampler: optional_index(
                        "linked sampler",
                        record.linked_sampler_index,
                        parameter_count,
                    )?,
                })
            })
            .collect::<Result<Vec<_>, BlobError>>()?;

        let constant_buffers = constant_buffer_records
            .iter()
            .map(|record| {
                let parameter_index = record.parameter_index as usize;
                if parameters
                    .get(parameter_index)
                    .map_or(true, |p| p.ty != ParameterType::ConstantBuffer)
                {
                    return Err(BlobError::IndexOutOfRange {
                        field: "constant buffer parameter",
                        index: i64::from(record.parameter_index),
                        count: parameter_count,
                    });
                }

                Ok(ConstantBufferDecl {
                    name: decode_name(&record.name)?,
                    size: record.size,
                    parameter_index: record.parameter_index,
                })
            })
            .collect::<Result<Vec<_>, BlobError>>()?;

        for parameter in &parameters {
            if let Some(sampler) = parameter.linked_sampler {
                if parameters[sampler as usize].ty != ParameterType::SamplerState {
                    return Err(BlobError::IndexOutOfRange {
                        field: "linked sampler",
                        index: i64::from(sampler),
                        count: parameter_count,
                    });
                }
            }
        }

        Ok(Self {
            feature_level: header.feature_level,
            stages,
            vertex_attributes,
            constant_buffers,
            parameters,
        })
    }

    pub fn write(&self) -> Result<Vec<u8>, BlobError> {
        let mut stage_size = [0; STAGE_COUNT];
        for (size, stage) in stage_size.iter_mut().zip(&self.stages) {
            *size = stage.len() as u32;
        }

        let header = Header {
            signature: SIGNATURE,
            version: VERSION,
            reserved: [0; 3],
            feature_level: self.feature_level,
            stage_size,
            vertex_attribute_count: self.vertex_attributes.len() as u32,
            constant_buffer_count: self.constant_buffers.len() as u32,
            parameter_count: self.parameters.len() as u32,
        };

        let mut out = Vec::new();
        out.extend_from_slice(bytemuck::bytes_of(&header));

        for stage in &self.stages {
            out.extend_from_slice(stage);
        }

        for attribute in &self.vertex_attributes {
            out.extend_from_slice(bytemuck::bytes_of(&VertexAttributeRecord {
                semantic: attribute.semantic as u32,
                semantic_index: attribute.semantic_index,
            }));
        }

        for buffer in &self.constant_buffers {
            out.extend_from_slice(bytemuck::bytes_of(&ConstantBufferRecord {
                name: encode_name(&buffer.name)?,
                size: buffer.size,
                parameter_index: buffer.parameter_index,
            }));
        }

        for parameter in &self.parameters {
            let mut bind_point = [-1; STAGE_COUNT];
            for (raw, point) in bind_point.iter_mut().zip(parameter.bind_points) {
                *raw = optional_raw(point);
            }

            out.extend_from_slice(bytemuck::bytes_of(&ParameterRecord {
                name: encode_name(&parameter.name)?,
                ty: parameter.ty as u32,
                constant_buffer_index: optional_raw(parameter.constant_buffer),
                constant_buffer_offset: parameter.constant_buffer_offset,
                array_size: parameter.array_size,
                array_stride: parameter.array_stride,
                bind_target: parameter.bind_target as u32,
                bind_point,
                linked_sampler_index: optional_raw(parameter.linked_sampler),
            }));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ShaderCacheEntry {
        let mut stages: [Vec<u8>; STAGE_COUNT] = Default::default();
        stages[0] = vec![1, 2, 3];
        stages[4] = vec![4, 5, 6, 7, 8];

        ShaderCacheEntry {
            feature_level: 0xb000,
            stages,
            vertex_attributes: vec![VertexAttribute {
                semantic: VertexSemantic::Position,
                semantic_index: 0,
            }],
            constant_buffers: vec![ConstantBufferDecl {
                name: "ObjectConstants".into(),
                size: 64,
                parameter_index: 0,
            }],
            parameters: vec![
                Parameter {
                    name: "ObjectConstants".into(),
                    ty: ParameterType::ConstantBuffer,
                    constant_buffer: None,
                    constant_buffer_offset: 0,
                    array_size: 0,
                    array_stride: 0,
                    bind_target: BindTarget::ConstantBuffer,
                    bind_points: [Some(0), None, None, None, Some(0), None],
                    linked_sampler: None,
                },
                Parameter {
                    name: "Tint".into(),
                    ty: ParameterType::Float4,
                    constant_buffer: Some(0),
                    constant_buffer_offset: 16,
                    array_size: 0,
                    array_stride: 16,
                    bind_target: BindTarget::None,
                    bind_points: [None; STAGE_COUNT],
                    linked_sampler: None,
                },
            ],
        }
    }

    #[test]
    fn written_entries_read_back() {
        let entry = sample();
        let bytes = entry.write().unwrap();
        assert_eq!(ShaderCacheEntry::read(&bytes), Ok(entry));
    }

    #[test]
    fn corrupt_headers_are_rejected() {
        let bytes = sample().write().unwrap();

        let mut bad_signature = bytes.clone();
        bad_signature[0] ^= 0xff;
        assert!(matches!(
            ShaderCacheEntry::read(&bad_signature),
            Err(BlobError::BadSignature(_))
        ));

        let mut bad_version = bytes.clone();
        bad_version[4] = VERSION + 1;
        assert_eq!(
            ShaderCacheEntry::read(&bad_version),
            Err(BlobError::UnsupportedVersion(VERSION + 1))
        );

        assert!(matches!(
            ShaderCacheEntry::read(&bytes[..bytes.len() - 1]),
            Err(BlobError::Truncated { .. })
        ));

        let mut trailing = bytes;
        trailing.push(0);
        assert_eq!(
            ShaderCacheEntry::read(&trailing),
            Err(BlobError::TrailingBytes(1))
        );
    }

    #[test]
    fn bad_records_are_rejected() {
        let mut entry = sample();
        entry.parameters[1].constant_buffer = Some(3);
        assert!(matches!(
            ShaderCacheEntry::read(&entry.write().unwrap()),
            Err(BlobError::IndexOutOfRange { .. })
        ));

        let mut entry = sample();
        entry.constant_buffers[0].parameter_index = 1;
        assert!(matches!(
            ShaderCacheEntry::read(&entry.write().unwrap()),
            Err(BlobError::IndexOutOfRange { .. })
        ));

        let mut entry = sample();
        entry.parameters[1].linked_sampler = Some(0);
        assert!(matches!(
            ShaderCacheEntry::read(&entry.write().unwrap()),
            Err(BlobError::IndexOutOfRange { .. })
        ));

        let mut bytes = sample().write().unwrap();
        let semantic_offset = std::mem::size_of::<Header>() + 3 + 5;
        bytes[semantic_offset] = 200;
        assert!(matches!(
            ShaderCacheEntry::read(&bytes),
            Err(BlobError::InvalidEnum { .. })
        ));
    }

    #[test]
    fn long_names_are_refused() {
        let mut entry = sample();
        entry.parameters[1].name = "x".repeat(NAME_LENGTH);
        assert!(matches!(entry.write(), Err(BlobError::NameTooLong(_))));
    }
}
