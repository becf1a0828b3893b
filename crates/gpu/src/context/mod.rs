//! The immediate context: a state-tracking command recorder.
//!
//! Every setter compares against the shadowed state and only records
//! commands for real changes. Bindings are collected per stage and staged
//! into the frame's descriptor heaps lazily, at the next draw or dispatch
//! that reads them.

mod bindings;

use std::sync::Arc;

use bytemuck::Pod;
use geometry::{ScissorRect, Viewport};
use smallvec::{smallvec, SmallVec};

use crate::{
    backend::{Backend, ClearFlags, Command, IndexBufferView, VertexBufferView},
    commands::CommandListManager,
    constant_buffer::{ConstantBufferKind, LocalConstantBuffer},
    device::{ContextLease, Device},
    layout::{self, Pipe, PER_DRAW_CONSTANT_BUFFER_SLOTS, TABLE_CONSTANT_BUFFER_SLOTS},
    memory::{ScratchAllocation, CONSTANT_BUFFER_ALIGNMENT},
    output::{OutputBuffer, VSyncMode},
    pipeline_cache::PipelineStateKey,
    resource::{
        Buffer, ConstantBufferView, CpuDescriptor, DepthStencilView, GpuAddress, PipelineId,
        RenderTargetView, ResourceId, Sampler, ShaderResourceView, Texture, Tracked,
        UnorderedAccessView,
    },
    shader::{BindTarget, Parameter, ParameterType, ShaderProgram},
    state_tracker::{BarrierBatch, StateTracker},
    types::{
        BindingFamily, BlendDesc, DepthStencilDesc, IndexFormat, PixelFormat, PrimitiveTopology,
        RasterizerDesc, ResourceState, ShaderStage, MAX_RENDER_TARGETS, MAX_VERTEX_BUFFERS,
        STAGE_COUNT,
    },
    Error,
};

use bindings::{BoundView, StageBindings};

const ROOT_SLOTS: usize = PER_DRAW_CONSTANT_BUFFER_SLOTS as usize;

/// Which groups of state [`ImmediateContext::clear_state`] resets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClearState {
    /// The shader program and every stage binding.
    pub shaders: bool,
    /// Vertex and index buffers.
    pub buffers: bool,
    /// Fixed-function state, topology, viewport, and scissor.
    pub states: bool,
    /// Render targets and depth buffer. The output buffer becomes the target.
    pub render_targets: bool,
}

impl ClearState {
    pub const ALL: Self = Self {
        shaders: true,
        buffers: true,
        states: true,
        render_targets: true,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: Buffer,
    pub offset: u32,
    pub stride: u32,
}

impl VertexBufferBinding {
    fn view(&self) -> VertexBufferView {
        VertexBufferView {
            address: self.buffer.address.offset(u64::from(self.offset)),
            size: remaining(&self.buffer, self.offset),
            stride: self.stride,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub buffer: Buffer,
    pub format: IndexFormat,
    pub offset: u32,
}

impl IndexBufferBinding {
    fn view(&self) -> IndexBufferView {
        IndexBufferView {
            address: self.buffer.address.offset(u64::from(self.offset)),
            size: remaining(&self.buffer, self.offset),
            format: self.format,
        }
    }
}

fn remaining(buffer: &Buffer, offset: u32) -> u32 {
    u32::try_from(buffer.size.saturating_sub(u64::from(offset))).unwrap_or(u32::MAX)
}

/// A value for a resource-typed shader parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterResource {
    Texture(ShaderResourceView),
    Sampler(Sampler),
    Storage(UnorderedAccessView),
}

/// The context's copy of a local or per-draw constant buffer.
struct MirroredBuffer {
    kind: ConstantBufferKind,
    view: Option<ConstantBufferView>,
    data: LocalConstantBuffer,
    /// Where a per-draw buffer was last staged in the current frame.
    staged: Option<GpuAddress>,
}

/// Records GPU work for one device, tracking state so that only changes
/// reach the command list.
///
/// Only one context may exist per device at a time. Dropping it waits for
/// all submitted work to finish.
pub struct ImmediateContext<'d, B: Backend> {
    device: &'d Device<B>,
    commands: CommandListManager<'d, B>,
    tracker: StateTracker,
    constant_buffers: Vec<Option<MirroredBuffer>>,

    program: Option<Arc<ShaderProgram>>,
    pipeline: Option<PipelineId>,
    pipeline_dirty: bool,
    stages: [StageBindings; STAGE_COUNT],
    /// Engine constant buffer per root slot, for the current pipeline.
    root_buffers: [Option<u32>; ROOT_SLOTS],
    /// Addresses last set on the root slots, graphics then compute.
    root_addresses: [[Option<GpuAddress>; ROOT_SLOTS]; 2],

    rasterizer: Option<RasterizerDesc>,
    depth_stencil: Option<DepthStencilDesc>,
    stencil_ref: u8,
    blend: Option<BlendDesc>,
    blend_factor: [f32; 4],
    viewport: Viewport,
    scissor: ScissorRect,
    topology: Option<PrimitiveTopology>,
    vertex_buffers: [Option<VertexBufferBinding>; MAX_VERTEX_BUFFERS],
    index_buffer: Option<IndexBufferBinding>,
    render_targets: SmallVec<[Option<RenderTargetView>; MAX_RENDER_TARGETS]>,
    depth_view: Option<DepthStencilView>,

    // Dropped after `commands`, which waits for the GPU.
    output: Option<OutputBuffer<'d, B>>,
    draw_count: u64,
    _lease: ContextLease<'d>,
}

impl<'d, B: Backend> ImmediateContext<'d, B> {
    pub(crate) fn new(device: &'d Device<B>, lease: ContextLease<'d>) -> Result<Self, Error> {
        let commands = CommandListManager::new(device)?;
        let viewport = Viewport::default();

        let mut context = Self {
            device,
            commands,
            tracker: StateTracker::new(),
            constant_buffers: Vec::new(),
            program: None,
            pipeline: None,
            pipeline_dirty: true,
            stages: std::array::from_fn(|_| StageBindings::new()),
            root_buffers: [None; ROOT_SLOTS],
            root_addresses: [[None; ROOT_SLOTS]; 2],
            rasterizer: None,
            depth_stencil: None,
            stencil_ref: 0,
            blend: None,
            blend_factor: [1.0; 4],
            viewport,
            scissor: viewport.scissor(),
            topology: None,
            vertex_buffers: [None; MAX_VERTEX_BUFFERS],
            index_buffer: None,
            render_targets: SmallVec::new(),
            depth_view: None,
            output: None,
            draw_count: 0,
            _lease: lease,
        };

        context.restore_state();
        Ok(context)
    }

    #[must_use]
    pub fn device(&self) -> &'d Device<B> {
        self.device
    }

    #[must_use]
    pub fn program(&self) -> Option<&Arc<ShaderProgram>> {
        self.program.as_ref()
    }

    #[must_use]
    pub fn output_buffer(&self) -> Option<&OutputBuffer<'d, B>> {
        self.output.as_ref()
    }

    #[must_use]
    pub fn render_targets(&self) -> &[Option<RenderTargetView>] {
        &self.render_targets
    }

    #[must_use]
    pub fn depth_stencil_view(&self) -> Option<DepthStencilView> {
        self.depth_view
    }

    #[must_use]
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    #[must_use]
    pub fn scissor_rect(&self) -> ScissorRect {
        self.scissor
    }

    #[must_use]
    pub fn rasterizer_state(&self) -> Option<RasterizerDesc> {
        self.rasterizer
    }

    /// The depth-stencil state and the stencil reference value.
    #[must_use]
    pub fn depth_stencil_state(&self) -> (Option<DepthStencilDesc>, u8) {
        (self.depth_stencil, self.stencil_ref)
    }

    /// The blend state and the blend factor.
    #[must_use]
    pub fn blend_state(&self) -> (Option<BlendDesc>, [f32; 4]) {
        (self.blend, self.blend_factor)
    }

    #[must_use]
    pub fn topology(&self) -> Option<PrimitiveTopology> {
        self.topology
    }

    #[must_use]
    pub fn vertex_buffers(&self) -> &[Option<VertexBufferBinding>] {
        &self.vertex_buffers
    }

    #[must_use]
    pub fn index_buffer(&self) -> Option<IndexBufferBinding> {
        self.index_buffer
    }

    /// Draws and dispatches recorded since the context was created.
    #[must_use]
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    /// Commands recorded since the last submission that produce GPU work.
    #[must_use]
    pub fn work_count(&self) -> u32 {
        self.commands.work_count()
    }

    /// Allocates memory from the current frame's scratch buffer. It stays
    /// valid until this frame slot is recycled.
    pub fn allocate_scratch_memory(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<ScratchAllocation<'_>, Error> {
        self.commands.allocate_scratch(size, alignment)
    }

    pub fn set_shader_program(&mut self, program: Option<Arc<ShaderProgram>>) {
        let unchanged = match (&self.program, &program) {
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            (None, None) => true,
            _ => false,
        };

        if !unchanged {
            self.program = program;
            self.pipeline_dirty = true;
        }
    }

    pub fn set_rasterizer_state(&mut self, state: Option<RasterizerDesc>) {
        if self.rasterizer != state {
            self.rasterizer = state;
            self.pipeline_dirty = true;
        }
    }

    pub fn set_depth_stencil_state(&mut self, state: Option<DepthStencilDesc>, stencil_ref: u8) {
        if self.depth_stencil != state {
            self.depth_stencil = state;
            self.pipeline_dirty = true;
        }

        if self.stencil_ref != stencil_ref {
            self.stencil_ref = stencil_ref;
            self.encode(Command::SetStencilRef(stencil_ref));
        }
    }

    pub fn set_blend_state(&mut self, state: Option<BlendDesc>, blend_factor: [f32; 4]) {
        if self.blend != state {
            self.blend = state;
            self.pipeline_dirty = true;
        }

        if self.blend_factor != blend_factor {
            self.blend_factor = blend_factor;
            self.encode(Command::SetBlendFactor(blend_factor));
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.viewport != viewport {
            self.viewport = viewport;
            self.encode(Command::SetViewport(viewport));
        }
    }

    pub fn set_scissor_rect(&mut self, scissor: ScissorRect) {
        if self.scissor != scissor {
            self.scissor = scissor;
            self.encode(Command::SetScissor(scissor));
        }
    }

    /// Sets the viewport and scissor to cover `target`, or the first bound
    /// target if `None`.
    pub fn set_full_viewport(&mut self, target: Option<&Texture>) {
        let extent = match target {
            Some(texture) => Some((texture.width, texture.height)),
            None => self.target_extent(),
        };

        let Some((width, height)) = extent else {
            log::warn!("no render target to size the viewport to");
            return;
        };

        let viewport = Viewport::covering(width, height);
        self.set_viewport(viewport);
        self.set_scissor_rect(viewport.scissor());
    }

    fn target_extent(&self) -> Option<(u32, u32)> {
        if let Some(target) = self.render_targets.iter().flatten().next() {
            return Some((target.texture.width, target.texture.height));
        }
        if let Some(depth) = self.depth_view {
            return Some((depth.texture.width, depth.texture.height));
        }
        self.output.as_ref().map(|o| (o.width(), o.height()))
    }

    /// Only a change of topology type requires a different pipeline.
    pub fn set_topology(&mut self, topology: Option<PrimitiveTopology>) {
        if self.topology == topology {
            return;
        }

        let type_changed =
            self.topology.map(|t| t.topology_type()) != topology.map(|t| t.topology_type());
        self.topology = topology;

        if let Some(topology) = topology {
            self.encode(Command::SetTopology(topology));
        }
        if type_changed {
            self.pipeline_dirty = true;
        }
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, binding: Option<VertexBufferBinding>) {
        self.set_vertex_buffers(slot, &[binding]);
    }

    pub fn set_vertex_buffers(&mut self, first: u32, bindings: &[Option<VertexBufferBinding>]) {
        let first = first as usize;
        let Some(slots) = self.vertex_buffers.get_mut(first..first + bindings.len()) else {
            log::warn!(
                "vertex buffer slots {first}..{} are out of range",
                first + bindings.len()
            );
            return;
        };

        if *slots == *bindings {
            return;
        }

        slots.copy_from_slice(bindings);
        self.encode(Command::SetVertexBuffers {
            first: first as u32,
            views: bindings.iter().map(|b| b.map(|b| b.view())).collect(),
        });
    }

    pub fn set_index_buffer(&mut self, binding: Option<IndexBufferBinding>) {
        if self.index_buffer != binding {
            self.index_buffer = binding;
            self.encode(Command::SetIndexBuffer(binding.map(|b| b.view())));
        }
    }

    /// Binds render targets and a depth buffer. With no targets and no depth
    /// buffer, the output buffer's back buffer and depth buffer are used.
    ///
    /// Targets leaving the binding are returned to their default state
    /// before targets entering it are transitioned.
    pub fn set_render_targets(
        &mut self,
        targets: &[Option<RenderTargetView>],
        depth: Option<DepthStencilView>,
    ) {
        if targets.len() > MAX_RENDER_TARGETS {
            log::warn!(
                "{} render targets requested, only {MAX_RENDER_TARGETS} are bound",
                targets.len()
            );
        }

        let targets = &targets[..targets.len().min(MAX_RENDER_TARGETS)];
        let count = targets.iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        let targets: SmallVec<[Option<RenderTargetView>; MAX_RENDER_TARGETS]> =
            targets[..count].iter().copied().collect();

        if targets == self.render_targets && depth == self.depth_view {
            return;
        }

        let outgoing: SmallVec<[Tracked; 9]> = self
            .render_targets
            .iter()
            .flatten()
            .map(|v| v.texture.tracked())
            .chain(self.depth_view.map(|v| v.texture.tracked()))
            .collect();
        let incoming: SmallVec<[(Tracked, ResourceState); 9]> = targets
            .iter()
            .flatten()
            .map(|v| (v.texture.tracked(), ResourceState::RenderTarget))
            .chain(depth.map(|v| (v.texture.tracked(), ResourceState::DepthWrite)))
            .collect();

        let mut batch = BarrierBatch::new();
        self.tracker.rebind_targets(&outgoing, &incoming, &mut batch);
        self.emit_barriers(batch);

        self.render_targets = targets;
        self.depth_view = depth;
        self.pipeline_dirty = true;
        self.sync_render_targets();
    }

    pub fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        view: Option<ConstantBufferView>,
    ) {
        let view = view.map(|v| BoundView {
            descriptor: v.descriptor,
            resource: None,
        });
        self.bind(stage, BindingFamily::ConstantBuffer, slot, view);
    }

    pub fn set_shader_resource(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        view: Option<ShaderResourceView>,
    ) {
        let view = view.map(|v| BoundView {
            descriptor: v.descriptor,
            resource: None,
        });
        self.bind(stage, BindingFamily::ShaderResource, slot, view);
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: Option<Sampler>) {
        let view = sampler.map(|s| BoundView {
            descriptor: s.descriptor,
            resource: None,
        });
        self.bind(stage, BindingFamily::Sampler, slot, view);
    }

    /// Binds an unordered-access view, moving the resource into the
    /// unordered-access state. A resource that is no longer bound to any
    /// UAV slot is returned to its default state.
    pub fn set_unordered_access(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        view: Option<UnorderedAccessView>,
    ) {
        if layout::table_parameter(stage, BindingFamily::UnorderedAccess).is_none() {
            log::warn!("the {stage:?} stage cannot bind unordered access views");
            return;
        }

        let bound = view.map(|v| BoundView {
            descriptor: v.descriptor,
            resource: Some(v.resource),
        });
        let Some(previous) = self.bind(stage, BindingFamily::UnorderedAccess, slot, bound) else {
            return;
        };

        let mut batch = BarrierBatch::new();
        if let Some(old) = previous.and_then(|p| p.resource) {
            if !self.is_bound_for_writing(old.id) {
                self.tracker.restore(old, &mut batch);
            }
        }
        if let Some(view) = view {
            self.tracker
                .transition(view.resource, ResourceState::UnorderedAccess, &mut batch);
        }
        self.emit_barriers(batch);
    }

    fn bind(
        &mut self,
        stage: ShaderStage,
        family: BindingFamily,
        slot: u32,
        view: Option<BoundView>,
    ) -> Option<Option<BoundView>> {
        let table = self.stages[stage.index()].table_mut(family);
        if slot as usize >= table.capacity() {
            log::warn!("{family:?} slot {slot} is out of range for the {stage:?} stage");
            return None;
        }
        table.set(slot as usize, view)
    }

    fn is_bound_for_writing(&self, resource: ResourceId) -> bool {
        self.stages.iter().any(|stage| {
            stage
                .table(BindingFamily::UnorderedAccess)
                .entries()
                .iter()
                .flatten()
                .any(|view| view.resource.is_some_and(|r| r.id == resource))
        })
    }

    /// Writes into a constant buffer's CPU copy. With `commit`, a changed
    /// buffer is uploaded immediately rather than at the next draw.
    pub fn write_constant_buffer(
        &mut self,
        index: u32,
        offset: usize,
        data: &[u8],
        commit: bool,
    ) -> Result<(), Error> {
        let changed = self.mirror(index)?.data.write(offset, data)?;
        if changed && commit {
            self.commit_constant_buffer(index)?;
        }
        Ok(())
    }

    /// Writes `count` elements of `copy_size` bytes each, packed in `data`,
    /// `stride` bytes apart starting at `offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn write_constant_buffer_strided(
        &mut self,
        index: u32,
        offset: usize,
        stride: usize,
        copy_size: usize,
        count: usize,
        data: &[u8],
        commit: bool,
    ) -> Result<(), Error> {
        let changed = self
            .mirror(index)?
            .data
            .write_strided(offset, stride, copy_size, count, data)?;
        if changed && commit {
            self.commit_constant_buffer(index)?;
        }
        Ok(())
    }

    /// Uploads the changed part of a constant buffer. Local buffers are
    /// copied into their GPU buffer; per-draw buffers are staged whole into
    /// scratch memory.
    pub fn commit_constant_buffer(&mut self, index: u32) -> Result<(), Error> {
        let Some(Some(mirror)) = self.constant_buffers.get_mut(index as usize) else {
            return Ok(());
        };

        match mirror.kind {
            ConstantBufferKind::Local => {
                let (Some(range), Some(view)) = (mirror.data.dirty_range(), mirror.view) else {
                    return Ok(());
                };

                let allocation = self
                    .commands
                    .allocate_scratch(range.len() as u64, 1)
                    .map_err(|e| {
                        log::error!("failed to stage constant buffer {index}: {e}");
                        e
                    })?;
                allocation
                    .data
                    .copy_from_slice(&mirror.data.data()[range.clone()]);
                let (src, src_offset) = (allocation.resource, allocation.offset);
                mirror.data.clear_dirty();

                let buffer = view.buffer.tracked();
                let mut batch = BarrierBatch::new();
                self.tracker
                    .transition(buffer, ResourceState::CopyDest, &mut batch);
                self.emit_barriers(batch);

                self.encode(Command::CopyBufferRegion {
                    dst: buffer.id,
                    dst_offset: range.start as u64,
                    src,
                    src_offset,
                    size: range.len() as u64,
                });

                let mut batch = BarrierBatch::new();
                self.tracker.restore(buffer, &mut batch);
                self.emit_barriers(batch);
                self.commands.record_work();
                Ok(())
            }
            ConstantBufferKind::PerDraw => self.stage_per_draw(index as usize),
            ConstantBufferKind::Global => Ok(()),
        }
    }

    fn stage_per_draw(&mut self, index: usize) -> Result<(), Error> {
        let Some(Some(mirror)) = self.constant_buffers.get_mut(index) else {
            return Ok(());
        };

        let allocation = self
            .commands
            .allocate_scratch(mirror.data.size() as u64, CONSTANT_BUFFER_ALIGNMENT)
            .map_err(|e| {
                log::error!("failed to stage per-draw constant buffer {index}: {e}");
                e
            })?;
        allocation.data.copy_from_slice(mirror.data.data());
        mirror.staged = Some(allocation.address);
        mirror.data.clear_dirty();
        Ok(())
    }

    /// The context's copy of a constant buffer, created on first use.
    fn mirror(&mut self, index: u32) -> Result<&mut MirroredBuffer, Error> {
        let slot = index as usize;
        if slot >= self.constant_buffers.len() {
            self.constant_buffers.resize_with(slot + 1, || None);
        }

        match &mut self.constant_buffers[slot] {
            Some(mirror) => Ok(mirror),
            empty => {
                let Some(info) = self.device.constant_buffer(index) else {
                    log::warn!("constant buffer {index} is not registered");
                    return Err(Error::InvalidHandle);
                };

                if info.kind == ConstantBufferKind::Global {
                    log::warn!(
                        "global constant buffer `{}` is written by its owner, not the context",
                        info.name
                    );
                    return Err(Error::InvalidArgument(
                        "global constant buffers cannot be written through a context",
                    ));
                }

                Ok(empty.insert(MirroredBuffer {
                    kind: info.kind,
                    view: info.view,
                    data: LocalConstantBuffer::new(info.size),
                    staged: None,
                }))
            }
        }
    }

    fn bound_program(&self) -> Result<Arc<ShaderProgram>, Error> {
        self.program.clone().ok_or_else(|| {
            log::warn!("shader parameters set with no program bound");
            Error::InvalidArgument("no shader program is bound")
        })
    }

    pub fn set_shader_parameter_value<T: Pod>(
        &mut self,
        parameter: u32,
        value: &T,
    ) -> Result<(), Error> {
        let program = self.bound_program()?;
        let (param, buffer) = parameter_storage(&program, parameter)?;

        let bytes = bytemuck::bytes_of(value);
        if bytes.len() != param.ty.value_size() as usize {
            log::warn!(
                "{} bytes written to shader parameter `{}` of type {:?}",
                bytes.len(),
                param.name,
                param.ty
            );
            return Err(Error::InvalidArgument(
                "value size does not match the parameter type",
            ));
        }

        self.write_constant_buffer(buffer, param.constant_buffer_offset as usize, bytes, false)
    }

    /// Writes consecutive elements of an array parameter, starting at
    /// `first_element`.
    pub fn set_shader_parameter_value_array<T: Pod>(
        &mut self,
        parameter: u32,
        first_element: u32,
        values: &[T],
    ) -> Result<(), Error> {
        let program = self.bound_program()?;
        let (param, buffer) = parameter_storage(&program, parameter)?;

        let element_size = std::mem::size_of::<T>();
        if element_size != param.ty.value_size() as usize {
            log::warn!(
                "{element_size}-byte elements written to shader parameter `{}` of type {:?}",
                param.name,
                param.ty
            );
            return Err(Error::InvalidArgument(
                "value size does not match the parameter type",
            ));
        }

        self.write_array(param, buffer, first_element, element_size, bytemuck::cast_slice(values))
    }

    /// Writes a struct parameter from its packed bytes.
    pub fn set_shader_parameter_struct(&mut self, parameter: u32, bytes: &[u8]) -> Result<(), Error> {
        let program = self.bound_program()?;
        let (param, buffer) = parameter_storage(&program, parameter)?;

        if param.ty != ParameterType::Struct || bytes.len() > param.array_stride.max(1) as usize {
            log::warn!(
                "{} bytes written to shader parameter `{}` of type {:?}",
                bytes.len(),
                param.name,
                param.ty
            );
            return Err(Error::InvalidArgument("parameter is not a struct of this size"));
        }

        self.write_constant_buffer(buffer, param.constant_buffer_offset as usize, bytes, false)
    }

    /// Writes elements of a struct array parameter. `bytes` holds
    /// consecutive elements of `element_size` bytes.
    pub fn set_shader_parameter_struct_array(
        &mut self,
        parameter: u32,
        first_element: u32,
        element_size: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let program = self.bound_program()?;
        let (param, buffer) = parameter_storage(&program, parameter)?;

        if param.ty != ParameterType::Struct
            || element_size == 0
            || element_size > param.array_stride as usize
        {
            log::warn!(
                "{element_size}-byte elements written to shader parameter `{}` of type {:?}",
                param.name,
                param.ty
            );
            return Err(Error::InvalidArgument("parameter is not a struct array of this size"));
        }

        self.write_array(param, buffer, first_element, element_size, bytes)
    }

    fn write_array(
        &mut self,
        param: &Parameter,
        buffer: u32,
        first_element: u32,
        element_size: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let count = bytes.len() / element_size;
        if count == 0 {
            return Ok(());
        }

        if first_element as usize + count > param.array_size.max(1) as usize {
            log::warn!(
                "elements {first_element}..{} written to shader parameter `{}` with {} elements",
                first_element as usize + count,
                param.name,
                param.array_size
            );
            return Err(Error::InvalidArgument("array write exceeds the parameter"));
        }

        let stride = param.array_stride as usize;
        let offset = param.constant_buffer_offset as usize + first_element as usize * stride;

        if stride == element_size || count == 1 {
            self.write_constant_buffer(buffer, offset, &bytes[..count * element_size], false)
        } else {
            self.write_constant_buffer_strided(
                buffer,
                offset,
                stride,
                element_size,
                count,
                bytes,
                false,
            )
        }
    }

    /// Binds a resource to every stage the parameter is visible to. For
    /// textures with a linked sampler parameter, `linked_sampler` is bound
    /// alongside.
    pub fn set_shader_parameter_resource(
        &mut self,
        parameter: u32,
        resource: Option<ParameterResource>,
        linked_sampler: Option<Sampler>,
    ) -> Result<(), Error> {
        let program = self.bound_program()?;
        let Some(param) = program.parameter(parameter) else {
            log::warn!("shader parameter {parameter} does not exist");
            return Err(Error::InvalidArgument("unknown shader parameter"));
        };

        let mismatch = || {
            log::warn!(
                "{resource:?} cannot be bound to shader parameter `{}` ({:?})",
                param.name,
                param.bind_target
            );
            Error::InvalidArgument("resource does not match the parameter")
        };

        let stages = bind_points(param);
        match (param.bind_target, resource) {
            (BindTarget::Resource, None | Some(ParameterResource::Texture(_))) => {
                let view = match resource {
                    Some(ParameterResource::Texture(view)) => Some(view),
                    _ => None,
                };
                for (stage, point) in stages {
                    self.set_shader_resource(stage, point, view);
                }
            }
            (BindTarget::Sampler, None | Some(ParameterResource::Sampler(_))) => {
                let sampler = match resource {
                    Some(ParameterResource::Sampler(sampler)) => Some(sampler),
                    _ => None,
                };
                for (stage, point) in stages {
                    self.set_sampler(stage, point, sampler);
                }
            }
            (BindTarget::UnorderedAccess, None | Some(ParameterResource::Storage(_))) => {
                let view = match resource {
                    Some(ParameterResource::Storage(view)) => Some(view),
                    _ => None,
                };
                for (stage, point) in stages {
                    self.set_unordered_access(stage, point, view);
                }
            }
            _ => return Err(mismatch()),
        }

        if let Some(sampler_param) = param.linked_sampler.and_then(|i| program.parameter(i)) {
            for (stage, point) in bind_points(sampler_param) {
                self.set_sampler(stage, point, linked_sampler);
            }
        }

        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.draw_instanced(vertex_count, 1, first_vertex);
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        if vertex_count == 0 || instance_count == 0 || !self.prepare(Pipe::Graphics) {
            return;
        }

        self.encode(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
        });
        self.record_draw();
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32) {
        self.draw_indexed_instanced(index_count, 1, first_index, base_vertex);
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) {
        if index_count == 0 || instance_count == 0 {
            return;
        }
        if self.index_buffer.is_none() {
            log::warn!("indexed draw skipped: no index buffer is bound");
            return;
        }
        if !self.prepare(Pipe::Graphics) {
            return;
        }

        self.encode(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
        });
        self.record_draw();
    }

    /// Draws `vertex_count` vertices of `stride` bytes read from `vertices`.
    /// The data is copied into scratch memory and bound to vertex buffer
    /// slot 0 for this draw only.
    pub fn draw_user_pointer(&mut self, vertices: &[u8], stride: u32, vertex_count: u32) {
        if vertex_count == 0 || stride == 0 {
            return;
        }

        let size = u64::from(stride) * u64::from(vertex_count);
        if (vertices.len() as u64) < size {
            log::warn!(
                "user-pointer draw skipped: {} bytes supplied for {vertex_count} vertices of {stride} bytes",
                vertices.len()
            );
            return;
        }

        let Ok(view_size) = u32::try_from(size) else {
            log::warn!("user-pointer draw skipped: {size} bytes of vertex data is too large");
            return;
        };

        if !self.prepare(Pipe::Graphics) {
            return;
        }

        let allocation = match self.commands.allocate_scratch(size, 16) {
            Ok(allocation) => allocation,
            Err(e) => {
                log::error!("user-pointer draw skipped: {e}");
                return;
            }
        };
        allocation
            .data
            .copy_from_slice(&vertices[..view_size as usize]);
        let view = VertexBufferView {
            address: allocation.address,
            size: view_size,
            stride,
        };

        self.encode(Command::SetVertexBuffers {
            first: 0,
            views: smallvec![Some(view)],
        });
        self.encode(Command::Draw {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
        });
        self.encode(Command::SetVertexBuffers {
            first: 0,
            views: smallvec![self.vertex_buffers[0].map(|b| b.view())],
        });
        self.record_draw();
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if x == 0 || y == 0 || z == 0 || !self.prepare(Pipe::Compute) {
            return;
        }

        self.encode(Command::Dispatch { x, y, z });
        self.record_draw();
    }

    fn record_draw(&mut self) {
        self.commands.record_work();
        self.draw_count += 1;
    }

    /// Clears the bound targets, or the output buffer if none are bound.
    pub fn clear_targets(
        &mut self,
        color: Option<[f32; 4]>,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) {
        let Some((targets, depth_view)) = self.current_targets() else {
            return;
        };

        let mut recorded = false;
        if let Some(color) = color {
            for target in &targets {
                self.encode(Command::ClearRenderTarget {
                    view: target.descriptor,
                    color,
                });
                recorded = true;
            }
        }

        if let Some(view) = depth_view.filter(|_| depth.is_some() || stencil.is_some()) {
            self.encode(Command::ClearDepthStencil {
                view: view.descriptor,
                flags: ClearFlags {
                    depth: depth.is_some(),
                    stencil: stencil.is_some(),
                },
                depth: depth.unwrap_or(1.0),
                stencil: stencil.unwrap_or(0),
            });
            recorded = true;
        }

        if recorded {
            self.commands.record_work();
        }
    }

    /// Tells the GPU the contents of the bound targets are no longer needed.
    /// The depth buffer is only discarded when both `depth` and `stencil`
    /// are set, since they share one resource.
    pub fn discard_targets(&mut self, color: bool, depth: bool, stencil: bool) {
        let Some((targets, depth_view)) = self.current_targets() else {
            return;
        };

        if color {
            for target in &targets {
                self.encode(Command::DiscardResource(target.texture.id));
            }
        }

        if let Some(view) = depth_view.filter(|_| depth && stencil) {
            self.encode(Command::DiscardResource(view.texture.id));
        }
    }

    fn current_targets(
        &self,
    ) -> Option<(
        SmallVec<[RenderTargetView; MAX_RENDER_TARGETS]>,
        Option<DepthStencilView>,
    )> {
        if !self.uses_output() {
            return Some((
                self.render_targets.iter().flatten().copied().collect(),
                self.depth_view,
            ));
        }

        let output = self.output.as_ref()?;
        Some((
            smallvec![output.current_back_buffer()],
            output.depth_stencil_view(),
        ))
    }

    /// Resets the selected groups of state to their defaults.
    pub fn clear_state(&mut self, what: ClearState) {
        if what.shaders {
            self.set_shader_program(None);

            let mut batch = BarrierBatch::new();
            for stage in &mut self.stages {
                for family in BindingFamily::ALL {
                    for view in stage.table_mut(family).clear() {
                        if let Some(resource) = view.resource {
                            self.tracker.restore(resource, &mut batch);
                        }
                    }
                }
                stage.mark_dirty();
            }
            self.emit_barriers(batch);
            self.root_buffers = [None; ROOT_SLOTS];
        }

        if what.buffers {
            if let Some(last) = self.vertex_buffers.iter().rposition(Option::is_some) {
                self.set_vertex_buffers(0, &[None; MAX_VERTEX_BUFFERS][..=last]);
            }
            self.set_index_buffer(None);
        }

        if what.states {
            self.set_rasterizer_state(None);
            self.set_depth_stencil_state(None, 0);
            self.set_blend_state(None, [1.0; 4]);
            self.set_topology(None);

            let empty = Viewport::covering(0, 0);
            self.set_viewport(empty);
            self.set_scissor_rect(empty.scissor());
        }

        if what.render_targets {
            self.set_render_targets(&[], None);
        }
    }

    /// Replaces the output buffer, returning the previous one. When a
    /// buffer is replaced the GPU is drained first, so the returned buffer
    /// is idle.
    pub fn set_output_buffer(
        &mut self,
        output: Option<OutputBuffer<'d, B>>,
    ) -> Option<OutputBuffer<'d, B>> {
        let uses_output = self.uses_output();
        self.release_back_buffer();

        let previous = std::mem::replace(&mut self.output, output);
        if previous.is_some() {
            if let Err(e) = self.commands.finish() {
                log::error!("failed to drain the GPU before replacing the output buffer: {e}");
            }
            self.invalidate_scratch();
            self.restore_state();
        } else if uses_output {
            self.sync_render_targets();
        }

        if uses_output {
            self.pipeline_dirty = true;
        }

        previous
    }

    /// Submits the frame, presents the output buffer, and moves on to the
    /// next frame slot. Blocks if the CPU is `frame_latency` frames ahead.
    pub fn present(&mut self) -> Result<(), Error> {
        let Some(back_buffer) = self.output.as_ref().map(|o| o.current_back_buffer()) else {
            log::warn!("present called with no output buffer");
            return Err(Error::InvalidArgument("no output buffer is bound"));
        };

        let mut batch = BarrierBatch::new();
        self.tracker.restore(back_buffer.texture.tracked(), &mut batch);
        self.emit_barriers(batch);

        self.commands.execute(false)?;

        if let Some(output) = &self.output {
            if let Err(e) = output.present() {
                log::error!("present failed: {e}");
            }
        }

        self.commands.rotate()?;
        self.invalidate_scratch();
        self.restore_state();
        Ok(())
    }

    /// Submits recorded work without waiting for it. Does nothing if no work
    /// was recorded since the last submission.
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.commands.has_work() {
            return Ok(());
        }

        self.commands.execute(true)?;
        self.restore_state();
        Ok(())
    }

    /// Submits recorded work and blocks until the GPU has finished all of it.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.commands.finish()?;
        self.invalidate_scratch();
        self.restore_state();
        Ok(())
    }

    /// Blocks until every previously submitted frame has completed. Work
    /// recorded since the last submission is not submitted.
    pub fn finish_pending_commands(&mut self) -> Result<(), Error> {
        self.commands.finish_pending()
    }

    /// Resizes the output buffer's back buffers. Zero matches the window.
    pub fn resize_output_buffer(&mut self, width: u32, height: u32) -> Result<(), Error> {
        let Some(vsync) = self.output.as_ref().map(|o| o.vsync()) else {
            return Err(Error::InvalidArgument("no output buffer is bound"));
        };
        self.rebuild_output(width, height, vsync)
    }

    /// Changes the output buffer's vsync mode. Switching to or from triple
    /// buffering recreates the back buffers.
    pub fn set_vsync(&mut self, vsync: VSyncMode) -> Result<(), Error> {
        let Some(output) = &mut self.output else {
            return Err(Error::InvalidArgument("no output buffer is bound"));
        };

        if output.vsync() == vsync {
            return Ok(());
        }

        if output.vsync_needs_resize(vsync) {
            let (width, height) = (output.width(), output.height());
            self.rebuild_output(width, height, vsync)
        } else {
            output.set_sync_interval(vsync);
            Ok(())
        }
    }

    fn rebuild_output(&mut self, width: u32, height: u32, vsync: VSyncMode) -> Result<(), Error> {
        self.release_back_buffer();
        if self.uses_output() {
            self.encode(Command::SetRenderTargets {
                render_targets: SmallVec::new(),
                depth_stencil: None,
            });
        }

        self.commands.finish()?;

        let result = match &mut self.output {
            Some(output) => output.resize(width, height, vsync),
            None => Ok(()),
        };

        self.invalidate_scratch();
        self.restore_state();
        result
    }

    fn uses_output(&self) -> bool {
        self.render_targets.is_empty() && self.depth_view.is_none()
    }

    /// Returns the current back buffer to the present state.
    fn release_back_buffer(&mut self) {
        let Some(back_buffer) = self.output.as_ref().map(|o| o.current_back_buffer()) else {
            return;
        };

        let mut batch = BarrierBatch::new();
        self.tracker.restore(back_buffer.texture.tracked(), &mut batch);
        self.emit_barriers(batch);
    }

    /// Re-records the render target binding, moving the current back buffer
    /// into the render target state if the output buffer is the target.
    fn sync_render_targets(&mut self) {
        let mut batch = BarrierBatch::new();

        let command = if self.uses_output() {
            match &self.output {
                Some(output) => {
                    let back_buffer = output.current_back_buffer();
                    self.tracker.transition(
                        back_buffer.texture.tracked(),
                        ResourceState::RenderTarget,
                        &mut batch,
                    );
                    Command::SetRenderTargets {
                        render_targets: smallvec![Some(back_buffer.descriptor)],
                        depth_stencil: output.depth_stencil_view().map(|v| v.descriptor),
                    }
                }
                None => Command::SetRenderTargets {
                    render_targets: SmallVec::new(),
                    depth_stencil: None,
                },
            }
        } else {
            Command::SetRenderTargets {
                render_targets: self
                    .render_targets
                    .iter()
                    .map(|t| t.map(|v| v.descriptor))
                    .collect(),
                depth_stencil: self.depth_view.map(|v| v.descriptor),
            }
        };

        self.emit_barriers(batch);
        self.encode(command);
    }

    /// Re-records every piece of state a fresh command list lacks.
    fn restore_state(&mut self) {
        for resource in self.device.take_released() {
            self.tracker.forget(resource);
        }

        let (view, sampler) = self.commands.descriptor_heaps();
        self.encode(Command::SetDescriptorHeaps { view, sampler });
        self.encode(Command::SetRootSignatures);

        self.pipeline = None;
        self.pipeline_dirty = true;
        for stage in &mut self.stages {
            stage.mark_dirty();
        }
        self.root_addresses = [[None; ROOT_SLOTS]; 2];

        self.sync_render_targets();
        self.encode(Command::SetViewport(self.viewport));
        self.encode(Command::SetScissor(self.scissor));

        if let Some(topology) = self.topology {
            self.encode(Command::SetTopology(topology));
        }

        if let Some(last) = self.vertex_buffers.iter().rposition(Option::is_some) {
            self.encode(Command::SetVertexBuffers {
                first: 0,
                views: self.vertex_buffers[..=last]
                    .iter()
                    .map(|b| b.map(|b| b.view()))
                    .collect(),
            });
        }

        if let Some(index_buffer) = self.index_buffer {
            self.encode(Command::SetIndexBuffer(Some(index_buffer.view())));
        }

        self.encode(Command::SetBlendFactor(self.blend_factor));
        self.encode(Command::SetStencilRef(self.stencil_ref));
    }

    /// Forgets per-draw buffers staged in a frame slot that has been
    /// recycled.
    fn invalidate_scratch(&mut self) {
        for mirror in self.constant_buffers.iter_mut().flatten() {
            mirror.staged = None;
        }
    }

    /// Brings the command list up to date for a draw or dispatch on `pipe`.
    /// Returns false, having logged why, if the work must be skipped.
    fn prepare(&mut self, pipe: Pipe) -> bool {
        let Some(program) = self.program.clone() else {
            log::warn!("draw skipped: no shader program is bound");
            return false;
        };

        if program.is_compute() != (pipe == Pipe::Compute) {
            log::warn!("draw skipped: the bound program does not match the {pipe:?} pipeline");
            return false;
        }

        if (self.pipeline_dirty || self.pipeline.is_none()) && !self.switch_pipeline(&program, pipe)
        {
            return false;
        }

        if let Err(e) = self.stage_tables(pipe) {
            log::error!("draw skipped: failed to stage descriptor tables: {e}");
            return false;
        }

        if let Err(e) = self.commit_program_buffers(&program) {
            log::error!("draw skipped: failed to upload constant buffers: {e}");
            return false;
        }

        self.bind_root_buffers(pipe);
        true
    }

    fn pipeline_key(&self) -> Option<PipelineStateKey> {
        let (Some(rasterizer), Some(depth_stencil), Some(blend), Some(topology)) =
            (self.rasterizer, self.depth_stencil, self.blend, self.topology)
        else {
            return None;
        };

        let mut key = PipelineStateKey {
            rasterizer,
            depth_stencil,
            blend,
            topology_type: topology.topology_type(),
            ..PipelineStateKey::default()
        };

        if self.uses_output() {
            if let Some(output) = &self.output {
                key.render_target_count = 1;
                key.render_target_formats[0] = output.format();
                key.depth_stencil_format = output.depth_format().unwrap_or_default();
            }
        } else {
            key.render_target_count = self.render_targets.len() as u32;
            for (format, target) in key.render_target_formats.iter_mut().zip(&self.render_targets) {
                *format = target.map_or(PixelFormat::Unknown, |t| t.texture.format);
            }
            key.depth_stencil_format = self
                .depth_view
                .map_or(PixelFormat::Unknown, |v| v.texture.format);
        }

        Some(key)
    }

    /// Selects the pipeline object for the current state and re-resolves
    /// where the program's engine constant buffers are bound.
    fn switch_pipeline(&mut self, program: &ShaderProgram, pipe: Pipe) -> bool {
        let key = match pipe {
            Pipe::Compute => PipelineStateKey::default(),
            Pipe::Graphics => match self.pipeline_key() {
                Some(key) => key,
                None => {
                    log::warn!(
                        "draw skipped: rasterizer, depth-stencil, and blend state and a topology must be set"
                    );
                    return false;
                }
            },
        };

        // Failures are logged by the program.
        let Ok(pipeline) = program.pipeline(self.device.backend(), &key) else {
            return false;
        };

        if self.pipeline != Some(pipeline) {
            self.encode(Command::SetPipeline(pipeline));
            self.pipeline = Some(pipeline);
        }
        self.pipeline_dirty = false;

        self.root_buffers = [None; ROOT_SLOTS];
        for (buffer, stage, register) in program.constant_buffer_bindings() {
            if Pipe::of(stage) != pipe {
                continue;
            }

            if register < TABLE_CONSTANT_BUFFER_SLOTS {
                match self.device.constant_buffer_view(buffer) {
                    Some(view) => {
                        self.set_constant_buffer(stage, register, Some(view));
                    }
                    None => log::warn!(
                        "per-draw constant buffer {buffer} cannot be bound to table register {register} of the {stage:?} stage"
                    ),
                }
            } else if let Some(slot) = self
                .root_buffers
                .get_mut((register - TABLE_CONSTANT_BUFFER_SLOTS) as usize)
            {
                *slot = Some(buffer);
            } else {
                log::warn!("constant buffer register {register} is outside the per-draw range");
            }
        }

        true
    }

    /// Copies every dirty binding table of `pipe`'s stages into the frame's
    /// descriptor heaps and points the root signature at the copies.
    fn stage_tables(&mut self, pipe: Pipe) -> Result<(), Error> {
        let stages: &[ShaderStage] = match pipe {
            Pipe::Graphics => &ShaderStage::GRAPHICS,
            Pipe::Compute => &[ShaderStage::Compute],
        };

        loop {
            let mut grew = false;

            for &stage in stages {
                for family in BindingFamily::ALL {
                    let table = self.stages[stage.index()].table(family);
                    if !table.is_dirty() {
                        continue;
                    }

                    let count = table.bound_count();
                    let Some(parameter) =
                        layout::table_parameter(stage, family).filter(|_| count > 0)
                    else {
                        self.stages[stage.index()].table_mut(family).clear_dirty();
                        continue;
                    };

                    let null = self.device.backend().null_descriptor(family);
                    let descriptors: SmallVec<[CpuDescriptor; 16]> = table
                        .entries()
                        .iter()
                        .map(|entry| entry.map_or(null, |view| view.descriptor))
                        .collect();

                    let kind = family.heap_kind();
                    let allocation = self.commands.allocate_descriptors(kind, count)?;
                    grew |= allocation.grew;
                    self.device
                        .backend()
                        .copy_descriptors(kind, allocation.cpu, &descriptors);

                    self.encode(match pipe {
                        Pipe::Graphics => Command::SetGraphicsTable {
                            parameter,
                            table: allocation.gpu,
                        },
                        Pipe::Compute => Command::SetComputeTable {
                            parameter,
                            table: allocation.gpu,
                        },
                    });
                    self.stages[stage.index()].table_mut(family).clear_dirty();
                }
            }

            if !grew {
                return Ok(());
            }

            // Tables staged before the heap was replaced point into the
            // retired heap, so everything is staged again in the new one.
            let (view, sampler) = self.commands.descriptor_heaps();
            self.encode(Command::SetDescriptorHeaps { view, sampler });
            for stage in &mut self.stages {
                stage.mark_dirty();
            }
        }
    }

    fn commit_program_buffers(&mut self, program: &ShaderProgram) -> Result<(), Error> {
        for buffer in program.constant_buffers() {
            let index = buffer.engine_index;

            let (kind, dirty, staged) = match self.constant_buffers.get(index as usize) {
                Some(Some(mirror)) => (
                    mirror.kind,
                    mirror.data.dirty_range().is_some(),
                    mirror.staged.is_some(),
                ),
                _ => match self.device.constant_buffer_kind(index) {
                    // Never written; its contents are zero.
                    Some(ConstantBufferKind::PerDraw) => {
                        self.mirror(index)?;
                        (ConstantBufferKind::PerDraw, false, false)
                    }
                    _ => continue,
                },
            };

            match kind {
                ConstantBufferKind::Local if dirty => self.commit_constant_buffer(index)?,
                ConstantBufferKind::PerDraw if dirty || !staged => {
                    self.stage_per_draw(index as usize)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Points each root constant buffer slot the pipeline reads at the
    /// buffer's current address, skipping slots that already hold it.
    fn bind_root_buffers(&mut self, pipe: Pipe) {
        let pipe_index = match pipe {
            Pipe::Graphics => 0,
            Pipe::Compute => 1,
        };

        for slot in 0..ROOT_SLOTS {
            let Some(buffer) = self.root_buffers[slot] else {
                continue;
            };

            let address = match self.constant_buffers.get(buffer as usize) {
                Some(Some(mirror)) if mirror.kind == ConstantBufferKind::PerDraw => mirror.staged,
                _ => self
                    .device
                    .constant_buffer_view(buffer)
                    .map(|view| view.buffer.address),
            };

            let Some(address) = address else {
                continue;
            };

            if self.root_addresses[pipe_index][slot] == Some(address) {
                continue;
            }

            let parameter = layout::per_draw_parameter(pipe, slot as u32);
            self.encode(match pipe {
                Pipe::Graphics => Command::SetGraphicsConstantBuffer { parameter, address },
                Pipe::Compute => Command::SetComputeConstantBuffer { parameter, address },
            });
            self.root_addresses[pipe_index][slot] = Some(address);
        }
    }

    fn emit_barriers(&self, batch: BarrierBatch) {
        if !batch.is_empty() {
            self.encode(Command::Barrier(batch));
        }
    }

    fn encode(&self, command: Command) {
        self.commands.encode(&command);
    }
}

/// The parameter and the engine constant buffer it is stored in.
fn parameter_storage(program: &ShaderProgram, index: u32) -> Result<(&Parameter, u32), Error> {
    let Some(param) = program.parameter(index) else {
        log::warn!("shader parameter {index} does not exist");
        return Err(Error::InvalidArgument("unknown shader parameter"));
    };

    let buffer = param
        .constant_buffer
        .and_then(|cb| program.constant_buffers().get(cb as usize))
        .map(|cb| cb.engine_index);

    match buffer {
        Some(buffer) => Ok((param, buffer)),
        None => {
            log::warn!("shader parameter `{}` is not stored in a constant buffer", param.name);
            Err(Error::InvalidArgument("parameter is not stored in a constant buffer"))
        }
    }
}

fn bind_points(param: &Parameter) -> impl Iterator<Item = (ShaderStage, u32)> + '_ {
    ShaderStage::ALL
        .into_iter()
        .filter_map(move |stage| param.bind_points[stage.index()].map(|point| (stage, point)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::recording::{Destroyed, Event, RecordingBackend},
        output::tests::{desc, window},
        resource::{BufferDesc, BufferUsage, TextureDesc},
        shader::{ConstantBufferDecl, ShaderCacheEntry},
        types::{CullMode, SamplerDesc},
        Config,
    };

    const OBJECT: u32 = 0;
    const MATERIAL: u32 = 1;

    const TINT: u32 = 2;
    const DIFFUSE: u32 = 3;
    const WEIGHTS: u32 = 5;

    fn config() -> Config {
        Config {
            scratch_buffer_size: 4096,
            max_scratch_buffer_size: 64 * 1024,
            scratch_view_descriptors: 64,
            scratch_sampler_descriptors: 16,
            ..Config::default()
        }
    }

    fn device() -> Device<RecordingBackend> {
        let _ = env_logger::builder().is_test(true).try_init();
        Device::new(RecordingBackend::new(), config())
    }

    fn points(stage: ShaderStage, register: u32) -> [Option<u32>; STAGE_COUNT] {
        let mut points = [None; STAGE_COUNT];
        points[stage.index()] = Some(register);
        points
    }

    fn parameter(name: &str, ty: ParameterType) -> Parameter {
        Parameter {
            name: name.into(),
            ty,
            constant_buffer: None,
            constant_buffer_offset: 0,
            array_size: 0,
            array_stride: 0,
            bind_target: BindTarget::None,
            bind_points: [None; STAGE_COUNT],
            linked_sampler: None,
        }
    }

    /// A vertex and pixel program reading a per-draw `Object` buffer at
    /// vertex register 10 and a local `Material` buffer at pixel register 0,
    /// with a texture and its sampler at pixel slot 0.
    fn program(device: &Device<RecordingBackend>) -> Arc<ShaderProgram> {
        if device.find_constant_buffer("Object").is_none() {
            device
                .register_constant_buffer("Object", 64, ConstantBufferKind::PerDraw)
                .unwrap();
            device
                .register_constant_buffer("Material", 64, ConstantBufferKind::Local)
                .unwrap();
        }

        let mut stages: [Vec<u8>; STAGE_COUNT] = Default::default();
        stages[ShaderStage::Vertex.index()] = vec![1; 8];
        stages[ShaderStage::Pixel.index()] = vec![2; 8];

        let parameters = vec![
            Parameter {
                bind_target: BindTarget::ConstantBuffer,
                bind_points: points(ShaderStage::Vertex, 10),
                ..parameter("Object", ParameterType::ConstantBuffer)
            },
            Parameter {
                bind_target: BindTarget::ConstantBuffer,
                bind_points: points(ShaderStage::Pixel, 0),
                ..parameter("Material", ParameterType::ConstantBuffer)
            },
            Parameter {
                constant_buffer: Some(1),
                constant_buffer_offset: 16,
                ..parameter("tint", ParameterType::Float4)
            },
            Parameter {
                bind_target: BindTarget::Resource,
                bind_points: points(ShaderStage::Pixel, 0),
                linked_sampler: Some(4),
                ..parameter("diffuse", ParameterType::Texture)
            },
            Parameter {
                bind_target: BindTarget::Sampler,
                bind_points: points(ShaderStage::Pixel, 0),
                ..parameter("diffuse_sampler", ParameterType::SamplerState)
            },
            Parameter {
                constant_buffer: Some(1),
                constant_buffer_offset: 32,
                array_size: 2,
                array_stride: 16,
                ..parameter("weights", ParameterType::Float)
            },
        ];

        let blob = ShaderCacheEntry {
            stages,
            constant_buffers: vec![
                ConstantBufferDecl {
                    name: "Object".into(),
                    size: 64,
                    parameter_index: 0,
                },
                ConstantBufferDecl {
                    name: "Material".into(),
                    size: 64,
                    parameter_index: 1,
                },
            ],
            parameters,
            ..ShaderCacheEntry::default()
        }
        .write()
        .unwrap();

        device.create_shader_program(&blob, &[]).unwrap()
    }

    fn ready(context: &mut ImmediateContext<'_, RecordingBackend>, program: &Arc<ShaderProgram>) {
        context.set_shader_program(Some(program.clone()));
        context.set_rasterizer_state(Some(RasterizerDesc::default()));
        context.set_depth_stencil_state(Some(DepthStencilDesc::default()), 0);
        context.set_blend_state(Some(BlendDesc::default()), [1.0; 4]);
        context.set_topology(Some(PrimitiveTopology::TriangleList));
    }

    fn render_target(device: &Device<RecordingBackend>) -> RenderTargetView {
        let texture = device
            .create_texture(&TextureDesc::render_target(64, 64, PixelFormat::R8G8B8A8Unorm))
            .unwrap();
        device.create_render_target_view(&texture).unwrap()
    }

    fn vertex_buffer(device: &Device<RecordingBackend>) -> VertexBufferBinding {
        let buffer = device
            .create_buffer(&BufferDesc {
                size: 1024,
                usage: BufferUsage::Vertex,
                writable: false,
            })
            .unwrap();
        VertexBufferBinding {
            buffer,
            offset: 0,
            stride: 16,
        }
    }

    fn draws(backend: &RecordingBackend) -> usize {
        backend.count_commands(|c| matches!(c, Command::Draw { .. }))
    }

    #[test]
    fn redundant_state_is_recorded_once() {
        let device = device();
        let program = program(&device);
        let vb = vertex_buffer(&device);
        let mut context = device.create_context().unwrap();
        device.backend().clear_events();

        context.set_vertex_buffer(0, Some(vb));
        context.set_vertex_buffer(0, Some(vb));
        assert_eq!(
            device
                .backend()
                .count_commands(|c| matches!(c, Command::SetVertexBuffers { .. })),
            1
        );

        ready(&mut context, &program);
        ready(&mut context, &program);
        context.draw(3, 0);
        context.draw(3, 0);

        let backend = device.backend();
        assert_eq!(backend.count_commands(|c| matches!(c, Command::SetPipeline(_))), 1);
        assert_eq!(backend.count_commands(|c| matches!(c, Command::SetTopology(_))), 1);
        assert_eq!(
            backend.count_commands(|c| matches!(c, Command::SetGraphicsConstantBuffer { .. })),
            1
        );
        assert_eq!(draws(backend), 2);
        assert_eq!(program.compile_count(), 1);
        assert_eq!(context.draw_count(), 2);
    }

    #[test]
    fn topology_within_a_type_keeps_the_pipeline() {
        let device = device();
        let program = program(&device);
        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);
        context.draw(3, 0);

        context.set_topology(Some(PrimitiveTopology::TriangleStrip));
        context.draw(3, 0);
        assert_eq!(program.compile_count(), 1);

        context.set_topology(Some(PrimitiveTopology::LineList));
        context.draw(2, 0);
        assert_eq!(program.compile_count(), 2);
    }

    #[test]
    fn unbound_slots_are_staged_as_null_descriptors() {
        let device = device();
        let program = program(&device);
        let texture = device
            .create_texture(&TextureDesc::render_target(4, 4, PixelFormat::R8G8B8A8Unorm))
            .unwrap();
        let a = device.create_texture_view(&texture).unwrap();
        let c = device.create_texture_view(&texture).unwrap();

        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);
        context.set_shader_resource(ShaderStage::Pixel, 0, Some(a));
        context.set_shader_resource(ShaderStage::Pixel, 2, Some(c));
        context.draw(3, 0);

        let backend = device.backend();
        let table = backend
            .commands()
            .into_iter()
            .find_map(|c| match c {
                Command::SetGraphicsTable {
                    parameter: 13,
                    table,
                } => Some(table),
                _ => None,
            })
            .unwrap();

        let null = backend.null_descriptor(BindingFamily::ShaderResource);
        assert_eq!(
            backend.descriptor_table(table, 3),
            vec![Some(a.descriptor), Some(null), Some(c.descriptor)]
        );
    }

    #[test]
    fn heap_growth_restages_every_table() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Device::new(
            RecordingBackend::new(),
            Config {
                scratch_view_descriptors: 4,
                ..config()
            },
        );
        let program = program(&device);
        let texture = device
            .create_texture(&TextureDesc::render_target(4, 4, PixelFormat::R8G8B8A8Unorm))
            .unwrap();
        let [a, b, c, d] = [(); 4].map(|()| device.create_texture_view(&texture).unwrap());
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();

        let srv_parameter =
            layout::table_parameter(ShaderStage::Pixel, BindingFamily::ShaderResource).unwrap();
        let sampler_parameter =
            layout::table_parameter(ShaderStage::Pixel, BindingFamily::Sampler).unwrap();

        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);
        context.set_shader_resource(ShaderStage::Pixel, 0, Some(a));
        context.set_shader_resource(ShaderStage::Pixel, 1, Some(b));
        context.set_shader_resource(ShaderStage::Pixel, 2, Some(c));
        context.set_sampler(ShaderStage::Pixel, 0, Some(sampler));
        context.draw(3, 0);

        // One constant buffer and three views fill the heap exactly.
        let backend = device.backend();
        let first_table = backend
            .commands()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Command::SetGraphicsTable { parameter, table } if parameter == srv_parameter => {
                    Some(table)
                }
                _ => None,
            })
            .unwrap();
        let old_heap = backend.descriptor_heap_of(first_table).unwrap();

        backend.clear_events();
        context.set_shader_resource(ShaderStage::Pixel, 0, Some(d));
        context.draw(3, 0);
        assert_eq!(draws(backend), 1);

        let commands = backend.commands();
        let switch = commands
            .iter()
            .position(|c| matches!(c, Command::SetDescriptorHeaps { .. }))
            .unwrap();
        let Command::SetDescriptorHeaps { view: new_heap, .. } = commands[switch] else {
            unreachable!();
        };
        assert_ne!(new_heap, old_heap);

        let restaged: Vec<_> = commands[switch..]
            .iter()
            .filter_map(|c| match *c {
                Command::SetGraphicsTable { parameter, table } => Some((parameter, table)),
                _ => None,
            })
            .collect();

        for &(parameter, table) in &restaged {
            if parameter != sampler_parameter {
                assert_eq!(backend.descriptor_heap_of(table), Some(new_heap));
            }
        }

        let srv_table = restaged
            .iter()
            .find_map(|&(parameter, table)| (parameter == srv_parameter).then_some(table))
            .unwrap();
        assert_eq!(
            backend.descriptor_table(srv_table, 3),
            vec![Some(d.descriptor), Some(b.descriptor), Some(c.descriptor)]
        );

        let sampler_table = restaged
            .iter()
            .find_map(|&(parameter, table)| (parameter == sampler_parameter).then_some(table))
            .unwrap();
        assert_eq!(
            backend.descriptor_table(sampler_table, 1),
            vec![Some(sampler.descriptor)]
        );
    }

    #[test]
    fn scratch_overflow_retires_the_old_buffer() {
        let device = device();
        let mut context = device.create_context().unwrap();

        let first = context.allocate_scratch_memory(4000, 1).unwrap().resource;
        let second = context.allocate_scratch_memory(200, 1).unwrap().resource;
        assert_ne!(first, second);
        assert!(!device.backend().is_destroyed(Destroyed::Resource(first)));

        context.finish().unwrap();
        assert!(device.backend().is_destroyed(Destroyed::Resource(first)));
    }

    #[test]
    fn presents_block_once_the_latency_is_reached() {
        let device = Device::new(
            RecordingBackend::manual(),
            Config {
                frame_latency: 2,
                ..config()
            },
        );
        let (sender, receiver) = crossbeam::channel::unbounded();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut context = device.create_context().unwrap();
                let output = device.create_output_buffer(window(), &desc(8, 8)).unwrap();
                context.set_output_buffer(Some(output));

                for frame in 1..=3 {
                    context.present().unwrap();
                    sender.send(frame).unwrap();
                }
            });

            assert_eq!(receiver.recv().unwrap(), 1);
            assert_eq!(receiver.recv().unwrap(), 2);

            while device.backend().blocked_waiters() == 0 {
                std::thread::yield_now();
            }
            assert!(receiver.try_recv().is_err());

            device.backend().complete_through(1);
            assert_eq!(receiver.recv().unwrap(), 3);

            device.backend().complete_through(u64::MAX);
        });

        assert!(device.backend().blocking_waits() >= 1);
    }

    #[test]
    fn presents_never_block_when_the_gpu_keeps_up() {
        let device = device();
        let mut context = device.create_context().unwrap();
        let output = device.create_output_buffer(window(), &desc(8, 8)).unwrap();
        context.set_output_buffer(Some(output));

        for _ in 0..10 {
            context.present().unwrap();
        }
        assert_eq!(device.backend().blocking_waits(), 0);
    }

    #[test]
    fn outgoing_targets_are_restored_before_incoming_ones_transition() {
        let device = device();
        let a = render_target(&device);
        let b = render_target(&device);

        let mut context = device.create_context().unwrap();
        context.set_render_targets(&[Some(a)], None);
        device.backend().clear_events();

        context.set_render_targets(&[Some(b)], None);

        let barriers = device
            .backend()
            .commands()
            .into_iter()
            .find_map(|c| match c {
                Command::Barrier(batch) => Some(batch),
                _ => None,
            })
            .unwrap();

        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].resource, a.texture.id);
        assert_eq!(barriers[0].after, ResourceState::ShaderResource);
        assert_eq!(barriers[1].resource, b.texture.id);
        assert_eq!(barriers[1].after, ResourceState::RenderTarget);
    }

    #[test]
    fn per_draw_buffers_are_rebound_after_a_pipeline_switch() {
        let device = device();
        let program = program(&device);
        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);

        context
            .write_constant_buffer(OBJECT, 0, &[1; 16], false)
            .unwrap();
        context.draw(3, 0);
        device.backend().clear_events();

        context.set_rasterizer_state(Some(RasterizerDesc {
            cull_mode: CullMode::None,
            ..RasterizerDesc::default()
        }));
        context
            .write_constant_buffer(OBJECT, 0, &[2; 16], false)
            .unwrap();
        context.draw(3, 0);

        let commands = device.backend().commands();
        let position = |f: &dyn Fn(&Command) -> bool| commands.iter().position(f).unwrap();
        let pipeline = position(&|c| matches!(c, Command::SetPipeline(_)));
        let buffer = position(&|c| {
            matches!(
                c,
                Command::SetGraphicsConstantBuffer { parameter: 16, .. }
            )
        });
        let draw = position(&|c| matches!(c, Command::Draw { .. }));

        assert!(pipeline < buffer && buffer < draw);
    }

    #[test]
    fn local_buffers_upload_only_the_dirty_range() {
        let device = device();
        let _program = program(&device);
        let material = device.constant_buffer_view(MATERIAL).unwrap();
        let mut context = device.create_context().unwrap();
        device.backend().clear_events();

        context
            .write_constant_buffer(MATERIAL, 4, &[1; 4], false)
            .unwrap();
        context
            .write_constant_buffer(MATERIAL, 12, &[2; 4], true)
            .unwrap();

        let copies: Vec<_> = device
            .backend()
            .commands()
            .into_iter()
            .filter(|c| matches!(c, Command::CopyBufferRegion { .. }))
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(matches!(
            copies[0],
            Command::CopyBufferRegion { dst, dst_offset: 4, size: 12, .. } if dst == material.buffer.id
        ));

        // Unchanged contents are not uploaded again.
        context
            .write_constant_buffer(MATERIAL, 12, &[2; 4], true)
            .unwrap();
        assert_eq!(
            device
                .backend()
                .count_commands(|c| matches!(c, Command::CopyBufferRegion { .. })),
            1
        );
    }

    #[test]
    fn draws_without_complete_state_are_skipped() {
        let device = device();
        let program = program(&device);
        let mut context = device.create_context().unwrap();

        context.draw(3, 0);
        context.set_shader_program(Some(program.clone()));
        context.draw(3, 0);
        context.dispatch(1, 1, 1);
        assert_eq!(draws(device.backend()), 0);

        ready(&mut context, &program);
        context.draw(0, 0);
        assert_eq!(draws(device.backend()), 0);

        context.draw(3, 0);
        assert_eq!(draws(device.backend()), 1);
        assert_eq!(context.draw_count(), 1);
    }

    #[test]
    fn failed_pipeline_compilation_skips_the_draw() {
        let device = device();
        let program = program(&device);
        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);

        device.backend().fail_pipelines(true);
        context.draw(3, 0);
        assert_eq!(draws(device.backend()), 0);

        device.backend().fail_pipelines(false);
        context.draw(3, 0);
        assert_eq!(draws(device.backend()), 1);
    }

    #[test]
    fn present_moves_back_buffers_through_the_present_state() {
        let device = device();
        let mut context = device.create_context().unwrap();
        let output = device.create_output_buffer(window(), &desc(8, 8)).unwrap();
        let first = output.current_back_buffer().texture.id;
        context.set_output_buffer(Some(output));
        device.backend().clear_events();

        context.present().unwrap();

        let events = device.backend().events();
        let position = |f: &dyn Fn(&Event) -> bool| events.iter().position(f).unwrap();

        let release = position(&|e| {
            matches!(e, Event::Encode(_, Command::Barrier(b))
                if b[0].resource == first && b[0].after == ResourceState::Present)
        });
        let execute = position(&|e| matches!(e, Event::Execute(_)));
        let present = position(&|e| matches!(e, Event::Present(_)));
        let signal = position(&|e| matches!(e, Event::Signal(_)));
        assert!(release < execute && execute < present && present < signal);

        let second = context
            .output_buffer()
            .unwrap()
            .current_back_buffer()
            .texture
            .id;
        assert_ne!(first, second);
        assert!(events.iter().skip(signal).any(|e| matches!(
            e,
            Event::Encode(_, Command::Barrier(b))
                if b[0].resource == second && b[0].after == ResourceState::RenderTarget
        )));
    }

    #[test]
    fn flush_only_submits_recorded_work() {
        let device = device();
        let program = program(&device);
        let mut context = device.create_context().unwrap();
        device.backend().clear_events();

        context.flush().unwrap();
        let executed = |backend: &RecordingBackend| {
            backend
                .events()
                .iter()
                .filter(|e| matches!(e, Event::Execute(_)))
                .count()
        };
        assert_eq!(executed(device.backend()), 0);

        ready(&mut context, &program);
        context.draw(3, 0);
        context.flush().unwrap();
        assert_eq!(executed(device.backend()), 1);
        assert_eq!(context.work_count(), 0);
        assert!(!device
            .backend()
            .events()
            .iter()
            .any(|e| matches!(e, Event::Signal(_))));
    }

    #[test]
    fn user_pointer_draws_restore_vertex_buffer_zero() {
        let device = device();
        let program = program(&device);
        let vb = vertex_buffer(&device);
        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);
        context.set_vertex_buffer(0, Some(vb));
        device.backend().clear_events();

        context.draw_user_pointer(&[0; 48], 16, 3);

        let bindings: Vec<_> = device
            .backend()
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::SetVertexBuffers { views, .. } => Some(views[0]),
                _ => None,
            })
            .collect();

        assert_eq!(bindings.len(), 2);
        assert_ne!(bindings[0].unwrap().address, vb.buffer.address);
        assert_eq!(bindings[1], Some(vb.view()));
        assert_eq!(draws(device.backend()), 1);
    }

    #[test]
    fn parameters_write_into_their_constant_buffer() {
        let device = device();
        let program = program(&device);
        let material = device.constant_buffer_view(MATERIAL).unwrap();
        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);

        context
            .set_shader_parameter_value(TINT, &[1.0f32, 0.5, 0.25, 1.0])
            .unwrap();
        assert!(context.set_shader_parameter_value(TINT, &1.0f32).is_err());

        context
            .set_shader_parameter_value_array(WEIGHTS, 0, &[1.0f32, 2.0])
            .unwrap();
        assert!(context
            .set_shader_parameter_value_array(WEIGHTS, 1, &[1.0f32, 2.0])
            .is_err());

        device.backend().clear_events();
        context.draw(3, 0);

        let copies: Vec<_> = device
            .backend()
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::CopyBufferRegion {
                    dst,
                    dst_offset,
                    size,
                    ..
                } => Some((dst, dst_offset, size)),
                _ => None,
            })
            .collect();

        // tint at 16..32, weights at 32..36 and 48..52
        assert_eq!(copies, vec![(material.buffer.id, 16, 36)]);
    }

    #[test]
    fn texture_parameters_bind_their_linked_sampler() {
        let device = device();
        let program = program(&device);
        let texture = device
            .create_texture(&TextureDesc::render_target(4, 4, PixelFormat::R8G8B8A8Unorm))
            .unwrap();
        let view = device.create_texture_view(&texture).unwrap();
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();

        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);
        context
            .set_shader_parameter_resource(
                DIFFUSE,
                Some(ParameterResource::Texture(view)),
                Some(sampler),
            )
            .unwrap();
        assert!(context
            .set_shader_parameter_resource(DIFFUSE, Some(ParameterResource::Sampler(sampler)), None)
            .is_err());
        context.draw(3, 0);

        let backend = device.backend();
        let table = |parameter: u32| {
            backend
                .commands()
                .into_iter()
                .find_map(|c| match c {
                    Command::SetGraphicsTable { parameter: p, table } if p == parameter => {
                        Some(table)
                    }
                    _ => None,
                })
                .unwrap()
        };

        assert_eq!(backend.descriptor_table(table(13), 1), vec![Some(view.descriptor)]);
        assert_eq!(backend.descriptor_table(table(14), 1), vec![Some(sampler.descriptor)]);
        assert_eq!(
            backend.descriptor_table(table(12), 1),
            vec![Some(device.constant_buffer_view(MATERIAL).unwrap().descriptor)]
        );
    }

    #[test]
    fn unordered_access_bindings_transition_their_resource() {
        let device = device();
        let texture = device
            .create_texture(&TextureDesc {
                unordered_access: true,
                ..TextureDesc::render_target(4, 4, PixelFormat::R8G8B8A8Unorm)
            })
            .unwrap();
        let uav = device.create_texture_uav(&texture).unwrap();

        let mut context = device.create_context().unwrap();
        device.backend().clear_events();

        context.set_unordered_access(ShaderStage::Pixel, 0, Some(uav));
        context.set_unordered_access(ShaderStage::Pixel, 1, Some(uav));
        context.set_unordered_access(ShaderStage::Pixel, 0, None);
        context.set_unordered_access(ShaderStage::Pixel, 1, None);

        let barriers: Vec<_> = device
            .backend()
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Barrier(batch) => Some(batch[0].after),
                _ => None,
            })
            .collect();
        assert_eq!(
            barriers,
            vec![ResourceState::UnorderedAccess, ResourceState::ShaderResource]
        );
    }

    #[test]
    fn resizing_the_output_drains_the_gpu() {
        let device = device();
        let mut context = device.create_context().unwrap();
        let output = device.create_output_buffer(window(), &desc(8, 8)).unwrap();
        context.set_output_buffer(Some(output));
        device.backend().clear_events();

        context.resize_output_buffer(32, 16).unwrap();

        let events = device.backend().events();
        let signal = events
            .iter()
            .position(|e| matches!(e, Event::Signal(_)))
            .unwrap();
        let resize = events
            .iter()
            .position(|e| matches!(e, Event::ResizeSwapChain(_)))
            .unwrap();
        assert!(signal < resize);

        let output = context.output_buffer().unwrap();
        assert_eq!((output.width(), output.height()), (32, 16));

        context.set_vsync(VSyncMode::TripleBuffering).unwrap();
        assert_eq!(context.output_buffer().unwrap().buffer_count(), 3);
    }

    #[test]
    fn clear_targets_fall_back_to_the_output_buffer() {
        let device = device();
        let mut context = device.create_context().unwrap();
        let output = device.create_output_buffer(window(), &desc(8, 8)).unwrap();
        let back_buffer = output.current_back_buffer().descriptor;
        context.set_output_buffer(Some(output));
        device.backend().clear_events();

        context.clear_targets(Some([0.0; 4]), Some(1.0), None);

        let commands = device.backend().commands();
        assert!(commands.contains(&Command::ClearRenderTarget {
            view: back_buffer,
            color: [0.0; 4],
        }));
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::ClearDepthStencil {
                flags: ClearFlags {
                    depth: true,
                    stencil: false
                },
                ..
            }
        )));
        assert_eq!(context.work_count(), 1);
    }

    #[test]
    fn bound_state_reads_back() {
        let device = device();
        let vb = vertex_buffer(&device);
        let ib = IndexBufferBinding {
            buffer: vb.buffer,
            format: IndexFormat::U16,
            offset: 512,
        };
        let rasterizer = RasterizerDesc {
            cull_mode: CullMode::Front,
            ..RasterizerDesc::default()
        };

        let mut context = device.create_context().unwrap();
        assert_eq!(context.rasterizer_state(), None);
        assert_eq!(context.topology(), None);

        context.set_rasterizer_state(Some(rasterizer));
        context.set_depth_stencil_state(Some(DepthStencilDesc::default()), 7);
        context.set_blend_state(Some(BlendDesc::default()), [0.5; 4]);
        context.set_topology(Some(PrimitiveTopology::TriangleStrip));
        context.set_vertex_buffer(1, Some(vb));
        context.set_index_buffer(Some(ib));

        assert_eq!(context.rasterizer_state(), Some(rasterizer));
        assert_eq!(
            context.depth_stencil_state(),
            (Some(DepthStencilDesc::default()), 7)
        );
        assert_eq!(context.blend_state(), (Some(BlendDesc::default()), [0.5; 4]));
        assert_eq!(context.topology(), Some(PrimitiveTopology::TriangleStrip));
        assert_eq!(context.vertex_buffers()[..2], [None, Some(vb)]);
        assert_eq!(context.index_buffer(), Some(ib));

        context.clear_state(ClearState {
            buffers: true,
            states: true,
            ..ClearState::default()
        });
        assert_eq!(context.rasterizer_state(), None);
        assert_eq!(context.depth_stencil_state(), (None, 0));
        assert_eq!(context.blend_state(), (None, [1.0; 4]));
        assert_eq!(context.topology(), None);
        assert!(context.vertex_buffers().iter().all(Option::is_none));
        assert_eq!(context.index_buffer(), None);
    }

    #[test]
    fn released_targets_leave_the_tracker() {
        let device = device();
        let target = render_target(&device);
        let mut context = device.create_context().unwrap();

        context.set_render_targets(&[Some(target)], None);
        assert_eq!(context.tracker.len(), 1);

        device.release_texture(target.texture);
        context.finish().unwrap();
        assert!(context.tracker.is_empty());

        device.backend().clear_events();
        context.set_render_targets(&[], None);
        assert_eq!(
            device.backend().count_commands(|c| matches!(c, Command::Barrier(_))),
            0
        );
    }

    #[test]
    fn clear_state_resets_each_group() {
        let device = device();
        let program = program(&device);
        let target = render_target(&device);
        let mut context = device.create_context().unwrap();
        ready(&mut context, &program);
        context.set_render_targets(&[Some(target)], None);
        context.set_full_viewport(None);
        assert_eq!(context.viewport(), Viewport::covering(64, 64));

        context.clear_state(ClearState {
            render_targets: true,
            ..ClearState::default()
        });
        assert!(context.render_targets().is_empty());
        assert!(context.program().is_some());

        context.clear_state(ClearState::ALL);
        assert!(context.program().is_none());
        assert_eq!(context.viewport(), Viewport::covering(0, 0));

        device.backend().clear_events();
        context.draw(3, 0);
        assert_eq!(draws(device.backend()), 0);
    }
}
