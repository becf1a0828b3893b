//! The owner of every object that outlives a single context.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};
use raw_window_handle::RawWindowHandle;

use crate::{
    backend::Backend,
    constant_buffer::{ConstantBufferInfo, ConstantBufferKind, ConstantBufferRegistry},
    context::ImmediateContext,
    deletion::{DeletionQueue, Retired},
    memory::{next_multiple_of, CONSTANT_BUFFER_ALIGNMENT},
    output::{OutputBuffer, OutputBufferDesc},
    resource::{
        Buffer, BufferDesc, BufferUsage, ConstantBufferView, CpuDescriptor, DepthStencilView,
        RenderTargetView, ResourceId, Sampler, ShaderResourceView, Texture, TextureDesc,
        UnorderedAccessView, ViewDesc,
    },
    shader::{ShaderCacheEntry, ShaderProgram},
    types::{PixelFormat, SamplerDesc, VertexElementDesc},
    Config, Error,
};

/// Owns the backend, the deferred deletion queue, and the engine constant
/// buffer registry. Contexts and output buffers borrow it.
pub struct Device<B: Backend> {
    backend: B,
    config: Config,
    deletion: Arc<DeletionQueue>,
    constant_buffers: RwLock<ConstantBufferRegistry>,
    context_active: AtomicBool,
    /// Resources released while a context is live. The context drops their
    /// tracked states at its next command list swap.
    released: Mutex<Vec<ResourceId>>,
}

impl<B: Backend> Device<B> {
    pub fn new(backend: B, config: Config) -> Self {
        Self {
            backend,
            config,
            deletion: Arc::new(DeletionQueue::new()),
            constant_buffers: RwLock::new(ConstantBufferRegistry::default()),
            context_active: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn deletion_queue(&self) -> &DeletionQueue {
        &self.deletion
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer, Error> {
        self.backend.create_buffer(desc)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture, Error> {
        self.backend.create_texture(desc)
    }

    pub fn create_render_target_view(&self, texture: &Texture) -> Result<RenderTargetView, Error> {
        let descriptor = self.backend.create_view(&ViewDesc::RenderTarget {
            resource: texture.id,
            format: texture.format,
        })?;
        Ok(RenderTargetView {
            descriptor,
            texture: *texture,
        })
    }

    pub fn create_depth_stencil_view(&self, texture: &Texture) -> Result<DepthStencilView, Error> {
        let descriptor = self.backend.create_view(&ViewDesc::DepthStencil {
            resource: texture.id,
            format: texture.format,
        })?;
        Ok(DepthStencilView {
            descriptor,
            texture: *texture,
        })
    }

    pub fn create_texture_view(&self, texture: &Texture) -> Result<ShaderResourceView, Error> {
        let descriptor = self.backend.create_view(&ViewDesc::ShaderResource {
            resource: texture.id,
            format: texture.format,
        })?;
        Ok(ShaderResourceView {
            descriptor,
            resource: texture.tracked(),
        })
    }

    pub fn create_buffer_view(&self, buffer: &Buffer) -> Result<ShaderResourceView, Error> {
        let descriptor = self.backend.create_view(&ViewDesc::ShaderResource {
            resource: buffer.id,
            format: PixelFormat::Unknown,
        })?;
        Ok(ShaderResourceView {
            descriptor,
            resource: buffer.tracked(),
        })
    }

    pub fn create_texture_uav(&self, texture: &Texture) -> Result<UnorderedAccessView, Error> {
        let descriptor = self.backend.create_view(&ViewDesc::UnorderedAccess {
            resource: texture.id,
            format: texture.format,
        })?;
        Ok(UnorderedAccessView {
            descriptor,
            resource: texture.tracked(),
        })
    }

    pub fn create_buffer_uav(&self, buffer: &Buffer) -> Result<UnorderedAccessView, Error> {
        let descriptor = self.backend.create_view(&ViewDesc::UnorderedAccess {
            resource: buffer.id,
            format: PixelFormat::Unknown,
        })?;
        Ok(UnorderedAccessView {
            descriptor,
            resource: buffer.tracked(),
        })
    }

    pub fn create_constant_buffer_view(&self, buffer: &Buffer) -> Result<ConstantBufferView, Error> {
        let size = next_multiple_of(buffer.size, CONSTANT_BUFFER_ALIGNMENT);
        let size = u32::try_from(size).map_err(|_| Error::InvalidArgument("constant buffer too large"))?;

        let descriptor = self.backend.create_view(&ViewDesc::ConstantBuffer {
            buffer: buffer.id,
            address: buffer.address,
            size,
        })?;
        Ok(ConstantBufferView {
            descriptor,
            buffer: *buffer,
        })
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler, Error> {
        Ok(Sampler {
            descriptor: self.backend.create_sampler(desc)?,
        })
    }

    /// Destroys `buffer` once every frame recorded so far has completed.
    pub fn release_buffer(&self, buffer: Buffer) {
        self.release_resource(buffer.id);
    }

    pub fn release_texture(&self, texture: Texture) {
        self.release_resource(texture.id);
    }

    fn release_resource(&self, resource: ResourceId) {
        if self.context_active.load(Ordering::Acquire) {
            self.released.lock().push(resource);
        }
        self.deletion.retire(Retired::Resource(resource));
    }

    pub(crate) fn take_released(&self) -> Vec<ResourceId> {
        std::mem::take(&mut *self.released.lock())
    }

    /// Releases any view or sampler descriptor.
    pub fn release_view(&self, descriptor: CpuDescriptor) {
        self.deletion.retire(Retired::View(descriptor));
    }

    /// Registers an engine constant buffer that shaders refer to by name.
    ///
    /// Local buffers get a device-owned GPU buffer that contexts copy their
    /// CPU mirror into. Per-draw buffers have no GPU buffer of their own.
    /// Global buffers are owned by the caller and are registered with
    /// [`Device::register_global_constant_buffer`].
    pub fn register_constant_buffer(
        &self,
        name: &str,
        size: u32,
        kind: ConstantBufferKind,
    ) -> Result<u32, Error> {
        let view = match kind {
            ConstantBufferKind::Local => {
                let buffer = self.backend.create_buffer(&BufferDesc {
                    size: next_multiple_of(u64::from(size.max(1)), CONSTANT_BUFFER_ALIGNMENT),
                    usage: BufferUsage::Constant,
                    writable: false,
                })?;
                Some(self.create_constant_buffer_view(&buffer)?)
            }
            ConstantBufferKind::PerDraw => None,
            ConstantBufferKind::Global => {
                return Err(Error::InvalidArgument(
                    "global constant buffers must be registered with a view",
                ))
            }
        };

        self.push_constant_buffer(ConstantBufferInfo {
            name: name.to_owned(),
            size,
            kind,
            view,
        })
    }

    /// Registers a caller-owned buffer that shaders refer to by name.
    /// Contexts bind it but never write to it.
    pub fn register_global_constant_buffer(
        &self,
        name: &str,
        view: ConstantBufferView,
    ) -> Result<u32, Error> {
        let size = u32::try_from(view.buffer.size)
            .map_err(|_| Error::InvalidArgument("constant buffer too large"))?;

        self.push_constant_buffer(ConstantBufferInfo {
            name: name.to_owned(),
            size,
            kind: ConstantBufferKind::Global,
            view: Some(view),
        })
    }

    fn push_constant_buffer(&self, info: ConstantBufferInfo) -> Result<u32, Error> {
        let mut registry = self.constant_buffers.write();
        if registry.find(&info.name).is_some() {
            log::error!("constant buffer `{}` is already registered", info.name);

            if let (ConstantBufferKind::Local, Some(view)) = (info.kind, info.view) {
                self.deletion.retire(Retired::View(view.descriptor));
                self.deletion.retire(Retired::Resource(view.buffer.id));
            }
            return Err(Error::InvalidArgument("constant buffer name already registered"));
        }

        log::debug!("registered {:?} constant buffer `{}` ({} bytes)", info.kind, info.name, info.size);
        Ok(registry.push(info))
    }

    #[must_use]
    pub fn find_constant_buffer(&self, name: &str) -> Option<u32> {
        self.constant_buffers.read().find(name)
    }

    #[must_use]
    pub fn constant_buffer(&self, index: u32) -> Option<ConstantBufferInfo> {
        self.constant_buffers.read().get(index).cloned()
    }

    #[must_use]
    pub fn constant_buffer_kind(&self, index: u32) -> Option<ConstantBufferKind> {
        self.constant_buffers.read().get(index).map(|info| info.kind)
    }

    /// The GPU view of a local or global constant buffer.
    #[must_use]
    pub fn constant_buffer_view(&self, index: u32) -> Option<ConstantBufferView> {
        self.constant_buffers.read().get(index).and_then(|info| info.view)
    }

    #[must_use]
    pub fn constant_buffer_count(&self) -> usize {
        self.constant_buffers.read().len()
    }

    /// Loads a program from a compiled shader cache entry. The entry's vertex
    /// inputs are matched against `vertex_elements` and its constant buffers
    /// against the registry.
    pub fn create_shader_program(
        &self,
        blob: &[u8],
        vertex_elements: &[VertexElementDesc],
    ) -> Result<Arc<ShaderProgram>, Error> {
        let entry = ShaderCacheEntry::read(blob).map_err(|e| {
            log::error!("rejecting shader cache entry: {e}");
            e
        })?;

        let program = ShaderProgram::new(
            entry,
            vertex_elements,
            &self.constant_buffers.read(),
            self.deletion.clone(),
        )?;

        Ok(Arc::new(program))
    }

    pub fn create_output_buffer(
        &self,
        window: RawWindowHandle,
        desc: &OutputBufferDesc,
    ) -> Result<OutputBuffer<'_, B>, Error> {
        OutputBuffer::new(self, window, desc)
    }

    /// Creates the device's immediate context. Only one may exist at a time.
    pub fn create_context(&self) -> Result<ImmediateContext<'_, B>, Error> {
        let lease = ContextLease::acquire(&self.context_active)?;
        self.released.lock().clear();
        ImmediateContext::new(self, lease)
    }

    /// Destroys every retired object whose fence the GPU has passed.
    pub fn collect_garbage(&self) -> usize {
        self.deletion
            .collect(self.backend.completed_value(), &self.backend)
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        // Contexts borrow the device and finish their work when dropped, so
        // the GPU is idle here.
        for info in self.constant_buffers.get_mut().drain() {
            if let (ConstantBufferKind::Local, Some(view)) = (info.kind, info.view) {
                self.deletion.retire(Retired::View(view.descriptor));
                self.deletion.retire(Retired::Resource(view.buffer.id));
            }
        }

        self.deletion.destroy_all(&self.backend);
    }
}

/// Marks the device's context slot as taken for as long as it lives.
pub(crate) struct ContextLease<'d> {
    flag: &'d AtomicBool,
}

impl<'d> ContextLease<'d> {
    fn acquire(flag: &'d AtomicBool) -> Result<Self, Error> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ContextInUse)?;
        Ok(Self { flag })
    }
}

impl Drop for ContextLease<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::recording::{Destroyed, RecordingBackend},
        shader::{BindTarget, ConstantBufferDecl, Parameter, ParameterType},
        types::STAGE_COUNT,
        ShaderStage,
    };

    fn device() -> Device<RecordingBackend> {
        Device::new(RecordingBackend::new(), Config::default())
    }

    fn program_blob(constant_buffer: &str) -> Vec<u8> {
        let mut stages: [Vec<u8>; STAGE_COUNT] = Default::default();
        stages[ShaderStage::Vertex.index()] = vec![1; 4];

        ShaderCacheEntry {
            stages,
            constant_buffers: vec![ConstantBufferDecl {
                name: constant_buffer.into(),
                size: 64,
                parameter_index: 0,
            }],
            parameters: vec![Parameter {
                name: constant_buffer.into(),
                ty: ParameterType::ConstantBuffer,
                constant_buffer: None,
                constant_buffer_offset: 0,
                array_size: 0,
                array_stride: 0,
                bind_target: BindTarget::ConstantBuffer,
                bind_points: [Some(0), None, None, None, None, None],
                linked_sampler: None,
            }],
            ..ShaderCacheEntry::default()
        }
        .write()
        .unwrap()
    }

    #[test]
    fn local_constant_buffers_get_gpu_storage() {
        let device = device();

        let local = device
            .register_constant_buffer("Camera", 80, ConstantBufferKind::Local)
            .unwrap();
        let per_draw = device
            .register_constant_buffer("Object", 64, ConstantBufferKind::PerDraw)
            .unwrap();

        let info = device.constant_buffer(local).unwrap();
        assert_eq!(info.view.map(|v| v.buffer.size), Some(256));
        assert!(device.constant_buffer(per_draw).unwrap().view.is_none());
        assert_eq!(device.find_constant_buffer("Object"), Some(per_draw));

        assert!(matches!(
            device.register_constant_buffer("Camera", 16, ConstantBufferKind::Local),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.register_constant_buffer("Lights", 16, ConstantBufferKind::Global),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(device.constant_buffer_count(), 2);
    }

    #[test]
    fn global_constant_buffers_use_the_callers_buffer() {
        let device = device();
        let buffer = device
            .create_buffer(&BufferDesc {
                size: 512,
                usage: BufferUsage::Constant,
                writable: false,
            })
            .unwrap();
        let view = device.create_constant_buffer_view(&buffer).unwrap();

        let index = device.register_global_constant_buffer("Lights", view).unwrap();
        let info = device.constant_buffer(index).unwrap();
        assert_eq!(info.kind, ConstantBufferKind::Global);
        assert_eq!(info.size, 512);
        assert_eq!(info.view, Some(view));
    }

    #[test]
    fn programs_resolve_against_the_registry() {
        let device = device();
        device
            .register_constant_buffer("Material", 64, ConstantBufferKind::Local)
            .unwrap();

        let program = device.create_shader_program(&program_blob("Material"), &[]).unwrap();
        assert_eq!(program.constant_buffers()[0].engine_index, 0);

        assert!(matches!(
            device.create_shader_program(&program_blob("Skinning"), &[]),
            Err(Error::UnknownConstantBuffer(_))
        ));
        assert!(matches!(
            device.create_shader_program(&[0; 8], &[]),
            Err(Error::InvalidShaderCache(_))
        ));
    }

    #[test]
    fn releases_wait_for_the_cleanup_fence() {
        let device = device();
        let texture = device
            .create_texture(&TextureDesc::render_target(4, 4, PixelFormat::R8G8B8A8Unorm))
            .unwrap();

        device.deletion_queue().set_cleanup_fence(1);
        device.release_texture(texture);
        assert_eq!(device.collect_garbage(), 0);

        device.backend().signal(1).unwrap();
        assert_eq!(device.collect_garbage(), 1);
        assert!(device
            .backend()
            .is_destroyed(Destroyed::Resource(texture.id)));
    }

    #[test]
    fn one_context_at_a_time() {
        let device = device();

        let context = device.create_context().unwrap();
        assert!(matches!(device.create_context(), Err(Error::ContextInUse)));

        drop(context);
        assert!(device.create_context().is_ok());
    }

    #[test]
    fn releases_are_noted_only_while_a_context_lives() {
        let device = device();
        let texture = |device: &Device<RecordingBackend>| {
            device
                .create_texture(&TextureDesc::render_target(4, 4, PixelFormat::R8G8B8A8Unorm))
                .unwrap()
        };

        device.release_texture(texture(&device));
        assert!(device.take_released().is_empty());

        let context = device.create_context().unwrap();
        let kept = texture(&device);
        device.release_texture(kept);
        assert_eq!(device.take_released(), vec![kept.id]);
        assert!(device.take_released().is_empty());
        drop(context);
    }
}
