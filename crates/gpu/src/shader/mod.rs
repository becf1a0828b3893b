//! Shader programs loaded from compiled cache entries.
//!
//! A program owns its stage bytecode, the vertex layout it was created
//! against, its parameter table, and the pipeline objects compiled for it.

pub mod cache_entry;

use std::sync::Arc;

pub use cache_entry::{
    BindTarget, BlobError, ConstantBufferDecl, Parameter, ParameterType, ShaderCacheEntry,
    VertexAttribute,
};

use crate::{
    backend::{Backend, PipelineDesc},
    constant_buffer::ConstantBufferRegistry,
    deletion::{DeletionQueue, Retired},
    pipeline_cache::{PipelineCache, PipelineStateKey},
    resource::PipelineId,
    types::{ShaderStage, VertexElementDesc, STAGE_COUNT},
    Error,
};

/// A constant buffer the program reads, resolved against the device
/// registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramConstantBuffer {
    pub name: String,
    pub size: u32,
    pub parameter_index: u32,
    /// Index into the device's constant buffer registry.
    pub engine_index: u32,
}

pub struct ShaderProgram {
    stages: [Vec<u8>; STAGE_COUNT],
    vertex_elements: Vec<VertexElementDesc>,
    constant_buffers: Vec<ProgramConstantBuffer>,
    parameters: Vec<Parameter>,
    pipelines: PipelineCache<PipelineId>,
    deletion: Arc<DeletionQueue>,
}

impl ShaderProgram {
    pub(crate) fn new(
        entry: ShaderCacheEntry,
        vertex_elements: &[VertexElementDesc],
        registry: &ConstantBufferRegistry,
        deletion: Arc<DeletionQueue>,
    ) -> Result<Self, Error> {
        let matched_elements = entry
            .vertex_attributes
            .iter()
            .map(|attribute| {
                vertex_elements
                    .iter()
                    .find(|e| {
                        e.semantic == attribute.semantic
                            && e.semantic_index == attribute.semantic_index
                    })
                    .copied()
                    .ok_or_else(|| {
                        log::error!(
                            "shader input {}{} has no matching vertex element",
                            attribute.semantic.name(),
                            attribute.semantic_index
                        );
                        Error::UnmatchedVertexAttribute {
                            semantic: attribute.semantic,
                            index: attribute.semantic_index,
                        }
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let constant_buffers = entry
            .constant_buffers
            .into_iter()
            .map(|decl| {
                let Some(engine_index) = registry.find(&decl.name) else {
                    log::error!("shader requests unknown constant buffer `{}`", decl.name);
                    return Err(Error::UnknownConstantBuffer(decl.name));
                };

                if let Some(info) = registry.get(engine_index) {
                    if info.size < decl.size {
                        log::warn!(
                            "constant buffer `{}` is registered with {} bytes but the shader reads {}",
                            decl.name,
                            info.size,
                            decl.size
                        );
                    }
                }

                Ok(ProgramConstantBuffer {
                    name: decl.name,
                    size: decl.size,
                    parameter_index: decl.parameter_index,
                    engine_index,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            stages: entry.stages,
            vertex_elements: matched_elements,
            constant_buffers,
            parameters: entry.parameters,
            pipelines: PipelineCache::new(),
            deletion,
        })
    }

    #[must_use]
    pub fn is_compute(&self) -> bool {
        !self.stages[ShaderStage::Compute.index()].is_empty()
    }

    #[must_use]
    pub fn has_stage(&self, stage: ShaderStage) -> bool {
        !self.stages[stage.index()].is_empty()
    }

    #[must_use]
    pub fn vertex_elements(&self) -> &[VertexElementDesc] {
        &self.vertex_elements
    }

    #[must_use]
    pub fn constant_buffers(&self) -> &[ProgramConstantBuffer] {
        &self.constant_buffers
    }

    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    #[must_use]
    pub fn parameter(&self, index: u32) -> Option<&Parameter> {
        self.parameters.get(index as usize)
    }

    #[must_use]
    pub fn find_parameter(&self, name: &str) -> Option<u32> {
        self.parameters
            .iter()
            .position(|p| p.name == name)
            .map(|i| i as u32)
    }

    /// Every `(engine buffer, stage, register)` the program binds a constant
    /// buffer to.
    pub fn constant_buffer_bindings(&self) -> impl Iterator<Item = (u32, ShaderStage, u32)> + '_ {
        self.constant_buffers.iter().flat_map(move |buffer| {
            let parameter = &self.parameters[buffer.parameter_index as usize];
            ShaderStage::ALL.into_iter().filter_map(move |stage| {
                parameter.bind_points[stage.index()].map(|point| (buffer.engine_index, stage, point))
            })
        })
    }

    /// The pipeline object for `key`, compiling it on first use.
    pub fn pipeline<B: Backend + ?Sized>(
        &self,
        backend: &B,
        key: &PipelineStateKey,
    ) -> Result<PipelineId, Error> {
        self.pipelines.get_or_create(key, || {
            let stages = std::array::from_fn(|i| self.stages[i].as_slice());
            backend
                .create_pipeline(&PipelineDesc {
                    stages,
                    vertex_elements: &self.vertex_elements,
                    key,
                })
                .map_err(|e| {
                    log::error!("pipeline compilation failed: {e}");
                    e
                })
        })
    }

    /// The number of pipeline objects compiled for this program.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.pipelines.compile_count()
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        for pipeline in self.pipelines.drain() {
            self.deletion.retire(Retired::Pipeline(pipeline));
        }
    }
}

impl std::fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("compute", &self.is_compute())
            .field("constant_buffers", &self.constant_buffers)
            .field("parameters", &self.parameters.len())
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::recording::{Destroyed, RecordingBackend},
        constant_buffer::{ConstantBufferInfo, ConstantBufferKind},
        types::{VertexFormat, VertexSemantic},
    };

    fn entry() -> ShaderCacheEntry {
        let mut stages: [Vec<u8>; STAGE_COUNT] = Default::default();
        stages[ShaderStage::Vertex.index()] = vec![0xaa; 8];
        stages[ShaderStage::Pixel.index()] = vec![0xbb; 8];

        ShaderCacheEntry {
            stages,
            vertex_attributes: vec![VertexAttribute {
                semantic: VertexSemantic::TexCoord,
                semantic_index: 1,
            }],
            constant_buffers: vec![ConstantBufferDecl {
                name: "Object".into(),
                size: 16,
                parameter_index: 0,
            }],
            parameters: vec![Parameter {
                name: "Object".into(),
                ty: ParameterType::ConstantBuffer,
                constant_buffer: None,
                constant_buffer_offset: 0,
                array_size: 0,
                array_stride: 0,
                bind_target: BindTarget::ConstantBuffer,
                bind_points: [Some(1), None, None, None, Some(11), None],
                linked_sampler: None,
            }],
            ..ShaderCacheEntry::default()
        }
    }

    fn registry() -> ConstantBufferRegistry {
        let mut registry = ConstantBufferRegistry::default();
        registry.push(ConstantBufferInfo {
            name: "Frame".into(),
            size: 64,
            kind: ConstantBufferKind::PerDraw,
            view: None,
        });
        registry.push(ConstantBufferInfo {
            name: "Object".into(),
            size: 16,
            kind: ConstantBufferKind::PerDraw,
            view: None,
        });
        registry
    }

    fn element(semantic: VertexSemantic, semantic_index: u32) -> VertexElementDesc {
        VertexElementDesc {
            semantic,
            semantic_index,
            format: VertexFormat::Float2,
            stream_index: 0,
            stream_offset: 0,
            instance_step_rate: 0,
        }
    }

    #[test]
    fn attributes_must_match_elements() {
        let deletion = Arc::new(DeletionQueue::new());

        let program = ShaderProgram::new(
            entry(),
            &[
                element(VertexSemantic::Position, 0),
                element(VertexSemantic::TexCoord, 1),
            ],
            &registry(),
            deletion.clone(),
        )
        .unwrap();
        assert_eq!(
            program.vertex_elements(),
            &[element(VertexSemantic::TexCoord, 1)]
        );

        let error = ShaderProgram::new(
            entry(),
            &[element(VertexSemantic::TexCoord, 0)],
            &registry(),
            deletion,
        )
        .unwrap_err();
        assert!(matches!(
            error,
            Error::UnmatchedVertexAttribute {
                semantic: VertexSemantic::TexCoord,
                index: 1
            }
        ));
    }

    #[test]
    fn constant_buffers_resolve_by_name() {
        let deletion = Arc::new(DeletionQueue::new());
        let elements = [element(VertexSemantic::TexCoord, 1)];

        let program =
            ShaderProgram::new(entry(), &elements, &registry(), deletion.clone()).unwrap();
        assert_eq!(program.constant_buffers()[0].engine_index, 1);
        assert_eq!(
            program.constant_buffer_bindings().collect::<Vec<_>>(),
            vec![(1, ShaderStage::Vertex, 1), (1, ShaderStage::Pixel, 11)]
        );

        let error = ShaderProgram::new(
            entry(),
            &elements,
            &ConstantBufferRegistry::default(),
            deletion,
        )
        .unwrap_err();
        assert!(matches!(error, Error::UnknownConstantBuffer(name) if name == "Object"));
    }

    #[test]
    fn pipelines_are_cached_and_retired() {
        let backend = RecordingBackend::new();
        let deletion = Arc::new(DeletionQueue::new());
        let program = ShaderProgram::new(
            entry(),
            &[element(VertexSemantic::TexCoord, 1)],
            &registry(),
            deletion.clone(),
        )
        .unwrap();

        let key = PipelineStateKey::default();
        let first = program.pipeline(&backend, &key).unwrap();
        assert_eq!(program.pipeline(&backend, &key).unwrap(), first);
        assert_eq!(backend.compiled_pipelines(), 1);

        drop(program);
        assert_eq!(deletion.collect(0, &backend), 1);
        assert!(backend.is_destroyed(Destroyed::Pipeline(first)));
    }

    #[test]
    fn failed_compiles_are_retried() {
        let backend = RecordingBackend::new();
        let program = ShaderProgram::new(
            entry(),
            &[element(VertexSemantic::TexCoord, 1)],
            &registry(),
            Arc::new(DeletionQueue::new()),
        )
        .unwrap();

        let key = PipelineStateKey::default();
        backend.fail_pipelines(true);
        assert!(matches!(
            program.pipeline(&backend, &key),
            Err(Error::PipelineCompilation(_))
        ));

        backend.fail_pipelines(false);
        assert!(program.pipeline(&backend, &key).is_ok());
        assert_eq!(program.compile_count(), 1);
    }
}
