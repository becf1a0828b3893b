//! Direct3D 12 backend.

mod convert;
mod descriptors;
mod interfaces;
mod pipeline;
mod queue;
mod root_signature;
mod swap_chain;

use std::{mem::ManuallyDrop, ptr::NonNull};

use parking_lot::Mutex;
use raw_window_handle::RawWindowHandle;
use smallvec::SmallVec;
use structures::{GenerationalPool, Handle};
#[allow(clippy::wildcard_imports)]
use windows::Win32::{
    Foundation::RECT,
    Graphics::{Direct3D12::*, Dxgi::Common::*, Dxgi::IDXGISwapChain3},
};

use crate::{
    memory::{next_multiple_of, CONSTANT_BUFFER_ALIGNMENT},
    resource::{
        AllocatorId, Buffer, BufferDesc, CommandListId, CpuDescriptor, GpuAddress, GpuDescriptor,
        HeapId, PipelineId, RenderTargetView, ResourceId, SwapChainId, Texture, TextureDesc,
        ViewDesc,
    },
    types::{
        BindingFamily, DescriptorHeapKind, IndexFormat, PixelFormat, ResourceState, SamplerDesc,
    },
    BackendConfig, Error,
};

use self::{
    descriptors::CpuDescriptorHeap, interfaces::Interfaces, queue::Queue,
    root_signature::RootSignatures,
};

use super::{
    Backend, Command, DescriptorHeap, PipelineDesc, SwapChain, SwapChainDesc, UploadBuffer,
};

/// Maps a failed native call onto [`Error::Backend`].
trait Check<T> {
    fn check(self, call: &'static str) -> Result<T, Error>;
}

impl<T> Check<T> for windows::core::Result<T> {
    fn check(self, call: &'static str) -> Result<T, Error> {
        self.map_err(|e| {
            log::error!("{call} failed: {e}");
            Error::Backend {
                call,
                code: e.code().0,
            }
        })
    }
}

/// A non-owning copy of an interface pointer for use in descriptor structs.
/// The original must outlive every use of the copy.
fn borrowed<T: windows::core::ComInterface>(interface: &T) -> ManuallyDrop<Option<T>> {
    ManuallyDrop::new(Some(unsafe { std::mem::transmute_copy(interface) }))
}

fn transition_barrier(
    resource: &ID3D12Resource,
    state_before: D3D12_RESOURCE_STATES,
    state_after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: borrowed(resource),
                StateBefore: state_before,
                StateAfter: state_after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}

fn cpu_handle(descriptor: CpuDescriptor) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE {
        ptr: descriptor.0 as usize,
    }
}

fn heap_properties(kind: D3D12_HEAP_TYPE) -> D3D12_HEAP_PROPERTIES {
    D3D12_HEAP_PROPERTIES {
        Type: kind,
        CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
        MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
        CreationNodeMask: 0,
        VisibleNodeMask: 0,
    }
}

fn buffer_desc(size: u64, flags: D3D12_RESOURCE_FLAGS) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
        Alignment: 0, // default: 64k
        Width: size,
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: DXGI_FORMAT_UNKNOWN,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        Flags: flags,
    }
}

/// Native objects, keyed by the ids handed out through [`Backend`].
#[derive(Default)]
struct Objects {
    resources: GenerationalPool<ID3D12Resource>,
    heaps: GenerationalPool<ID3D12DescriptorHeap>,
    pipelines: GenerationalPool<ID3D12PipelineState>,
    allocators: GenerationalPool<ID3D12CommandAllocator>,
    lists: GenerationalPool<ID3D12GraphicsCommandList>,
    swap_chains: GenerationalPool<swap_chain::Entry>,
}

fn lookup<T>(pool: &GenerationalPool<T>, id: u64) -> Option<&T> {
    Handle::from_bits(id).and_then(|handle| pool.get(handle))
}

fn remove<T>(pool: &mut GenerationalPool<T>, id: u64) -> Option<T> {
    Handle::from_bits(id).and_then(|handle| pool.remove(handle))
}

impl Objects {
    fn resource(&self, id: ResourceId) -> Option<&ID3D12Resource> {
        let resource = lookup(&self.resources, id.0);
        if resource.is_none() {
            log::error!("{id:?} does not refer to a live resource");
        }
        resource
    }
}

struct Descriptors {
    views: CpuDescriptorHeap,
    samplers: CpuDescriptorHeap,
    render_targets: CpuDescriptorHeap,
    depth_stencils: CpuDescriptorHeap,
}

impl Descriptors {
    fn new(device: &ID3D12Device) -> Self {
        Self {
            views: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, 1024),
            samplers: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER, 256),
            render_targets: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_RTV, 64),
            depth_stencils: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_DSV, 64),
        }
    }

    fn free(&mut self, descriptor: CpuDescriptor) {
        let freed = self.views.free(descriptor)
            || self.samplers.free(descriptor)
            || self.render_targets.free(descriptor)
            || self.depth_stencils.free(descriptor);

        if !freed {
            log::error!("{descriptor:?} was not allocated by this backend");
        }
    }
}

pub struct Dx12Backend {
    objects: Mutex<Objects>,
    descriptors: Mutex<Descriptors>,
    /// Indexed like [`BindingFamily::ALL`].
    null_descriptors: [CpuDescriptor; 4],
    null_render_target: D3D12_CPU_DESCRIPTOR_HANDLE,
    root_signatures: RootSignatures,
    queue: Queue,
    dx: Interfaces,
}

// SAFETY: The device, queue and fence are free-threaded. Everything else is
// only touched while holding `objects` or `descriptors`.
unsafe impl Send for Dx12Backend {}
unsafe impl Sync for Dx12Backend {}

impl Dx12Backend {
    pub fn new(config: &BackendConfig) -> Result<Self, Error> {
        let dx = Interfaces::new(config)?;
        let queue = Queue::new(&dx)?;
        let root_signatures = RootSignatures::new(&dx.device)?;

        let mut descriptors = Descriptors::new(&dx.device);
        let null_descriptors = Self::create_null_descriptors(&dx.device, &mut descriptors)?;

        let null_render_target = descriptors.render_targets.allocate(&dx.device)?;
        unsafe {
            dx.device.CreateRenderTargetView(
                None::<&ID3D12Resource>,
                Some(&D3D12_RENDER_TARGET_VIEW_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                    Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_RTV {
                            MipSlice: 0,
                            PlaneSlice: 0,
                        },
                    },
                }),
                null_render_target,
            );
        }

        Ok(Self {
            objects: Mutex::new(Objects::default()),
            descriptors: Mutex::new(descriptors),
            null_descriptors,
            null_render_target,
            root_signatures,
            queue,
            dx,
        })
    }

    fn create_null_descriptors(
        device: &ID3D12Device,
        descriptors: &mut Descriptors,
    ) -> Result<[CpuDescriptor; 4], Error> {
        let constant_buffer = descriptors.views.allocate(device)?;
        let shader_resource = descriptors.views.allocate(device)?;
        let sampler = descriptors.samplers.allocate(device)?;
        let unordered_access = descriptors.views.allocate(device)?;

        unsafe {
            device.CreateConstantBufferView(
                Some(&D3D12_CONSTANT_BUFFER_VIEW_DESC {
                    BufferLocation: 0,
                    SizeInBytes: 0,
                }),
                constant_buffer,
            );

            device.CreateShaderResourceView(
                None::<&ID3D12Resource>,
                Some(&D3D12_SHADER_RESOURCE_VIEW_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                    Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                    Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: 1,
                            PlaneSlice: 0,
                            ResourceMinLODClamp: 0.0,
                        },
                    },
                }),
                shader_resource,
            );

            device.CreateSampler(&convert::sampler(&SamplerDesc::default()), sampler);

            device.CreateUnorderedAccessView(
                None::<&ID3D12Resource>,
                None::<&ID3D12Resource>,
                Some(&D3D12_UNORDERED_ACCESS_VIEW_DESC {
                    Format: DXGI_FORMAT_R8G8B8A8_UNORM,
                    ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                    Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_UAV {
                            MipSlice: 0,
                            PlaneSlice: 0,
                        },
                    },
                }),
                unordered_access,
            );
        }

        Ok([constant_buffer, shader_resource, sampler, unordered_access]
            .map(|handle| CpuDescriptor(handle.ptr as u64)))
    }

    fn create_resource(
        &self,
        heap: D3D12_HEAP_TYPE,
        desc: &D3D12_RESOURCE_DESC,
        initial_state: D3D12_RESOURCE_STATES,
        clear_value: Option<&D3D12_CLEAR_VALUE>,
    ) -> Result<ID3D12Resource, Error> {
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.dx.device.CreateCommittedResource(
                &heap_properties(heap),
                D3D12_HEAP_FLAG_NONE, // set automatically by CreateCommitedResource
                desc,
                initial_state,
                clear_value.map(|value| value as *const _),
                &mut resource,
            )
        }
        .check("CreateCommittedResource")?;

        resource.ok_or(Error::Backend {
            call: "CreateCommittedResource",
            code: 0,
        })
    }

    /// Registers the current back buffers of a swap chain, creating a render
    /// target view for each.
    fn acquire_back_buffers(
        &self,
        resources: &mut GenerationalPool<ID3D12Resource>,
        swap_chain: &IDXGISwapChain3,
        format: PixelFormat,
    ) -> Result<SmallVec<[(ResourceId, CpuDescriptor); 3]>, Error> {
        let mut descriptors = self.descriptors.lock();
        let mut back_buffers = SmallVec::new();

        for buffer in swap_chain::buffers(swap_chain)? {
            let rtv = descriptors.render_targets.allocate(&self.dx.device)?;
            unsafe {
                self.dx.device.CreateRenderTargetView(
                    &buffer,
                    Some(&D3D12_RENDER_TARGET_VIEW_DESC {
                        Format: convert::pixel_format(format),
                        ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_RTV {
                                MipSlice: 0,
                                PlaneSlice: 0,
                            },
                        },
                    }),
                    rtv,
                );
            }

            let id = ResourceId(resources.insert(buffer).to_bits());
            back_buffers.push((id, CpuDescriptor(rtv.ptr as u64)));
        }

        Ok(back_buffers)
    }

    fn release_back_buffers(
        &self,
        resources: &mut GenerationalPool<ID3D12Resource>,
        back_buffers: &mut SmallVec<[(ResourceId, CpuDescriptor); 3]>,
    ) {
        let mut descriptors = self.descriptors.lock();
        for (resource, rtv) in back_buffers.drain(..) {
            remove(resources, resource.0);
            descriptors.free(rtv);
        }
    }

    fn describe_swap_chain(id: SwapChainId, entry: &swap_chain::Entry) -> SwapChain {
        SwapChain {
            id,
            width: entry.width,
            height: entry.height,
            back_buffers: entry
                .back_buffers
                .iter()
                .map(|&(resource, descriptor)| RenderTargetView {
                    descriptor,
                    texture: Texture {
                        id: resource,
                        width: entry.width,
                        height: entry.height,
                        format: entry.format,
                        default_state: ResourceState::Present,
                    },
                })
                .collect(),
        }
    }

    unsafe fn record(&self, objects: &Objects, list: &ID3D12GraphicsCommandList, command: &Command) {
        match command {
            Command::Barrier(barriers) => {
                let native: SmallVec<[D3D12_RESOURCE_BARRIER; 4]> = barriers
                    .iter()
                    .filter_map(|barrier| {
                        let before = convert::resource_state(barrier.before);
                        let after = convert::resource_state(barrier.after);
                        // Present and Common share a native state.
                        if before == after {
                            return None;
                        }
                        let resource = objects.resource(barrier.resource)?;
                        Some(transition_barrier(resource, before, after))
                    })
                    .collect();

                if !native.is_empty() {
                    list.ResourceBarrier(&native);
                }
            }
            Command::SetDescriptorHeaps { view, sampler } => {
                let heaps = [
                    lookup(&objects.heaps, view.0).cloned(),
                    lookup(&objects.heaps, sampler.0).cloned(),
                ];
                if heaps.iter().any(Option::is_none) {
                    log::error!("binding a destroyed descriptor heap");
                    return;
                }
                list.SetDescriptorHeaps(&heaps);
            }
            Command::SetRootSignatures => {
                list.SetGraphicsRootSignature(&self.root_signatures.graphics);
                list.SetComputeRootSignature(&self.root_signatures.compute);
            }
            Command::SetPipeline(pipeline) => match lookup(&objects.pipelines, pipeline.0) {
                Some(pipeline) => list.SetPipelineState(pipeline),
                None => log::error!("{pipeline:?} does not refer to a live pipeline"),
            },
            Command::SetGraphicsTable { parameter, table } => {
                list.SetGraphicsRootDescriptorTable(
                    *parameter,
                    D3D12_GPU_DESCRIPTOR_HANDLE { ptr: table.0 },
                );
            }
            Command::SetComputeTable { parameter, table } => {
                list.SetComputeRootDescriptorTable(
                    *parameter,
                    D3D12_GPU_DESCRIPTOR_HANDLE { ptr: table.0 },
                );
            }
            Command::SetGraphicsConstantBuffer { parameter, address } => {
                list.SetGraphicsRootConstantBufferView(*parameter, address.0);
            }
            Command::SetComputeConstantBuffer { parameter, address } => {
                list.SetComputeRootConstantBufferView(*parameter, address.0);
            }
            Command::SetRenderTargets {
                render_targets,
                depth_stencil,
            } => {
                let handles: SmallVec<[D3D12_CPU_DESCRIPTOR_HANDLE; 8]> = render_targets
                    .iter()
                    .map(|target| target.map_or(self.null_render_target, cpu_handle))
                    .collect();
                let depth = depth_stencil.map(cpu_handle);

                list.OMSetRenderTargets(
                    handles.len() as u32,
                    (!handles.is_empty()).then_some(handles.as_ptr()),
                    false,
                    depth.as_ref().map(|handle| handle as *const _),
                );
            }
            Command::SetViewport(viewport) => {
                list.RSSetViewports(&[D3D12_VIEWPORT {
                    TopLeftX: viewport.origin.x,
                    TopLeftY: viewport.origin.y,
                    Width: viewport.extent.width,
                    Height: viewport.extent.height,
                    MinDepth: viewport.min_depth,
                    MaxDepth: viewport.max_depth,
                }]);
            }
            Command::SetScissor(rect) => {
                list.RSSetScissorRects(&[RECT {
                    left: rect.left(),
                    top: rect.top(),
                    right: rect.right(),
                    bottom: rect.bottom(),
                }]);
            }
            Command::SetTopology(topology) => {
                list.IASetPrimitiveTopology(convert::primitive_topology(*topology));
            }
            Command::SetVertexBuffers { first, views } => {
                let native: SmallVec<[D3D12_VERTEX_BUFFER_VIEW; 4]> = views
                    .iter()
                    .map(|view| {
                        view.map_or(D3D12_VERTEX_BUFFER_VIEW::default(), |view| {
                            D3D12_VERTEX_BUFFER_VIEW {
                                BufferLocation: view.address.0,
                                SizeInBytes: view.size,
                                StrideInBytes: view.stride,
                            }
                        })
                    })
                    .collect();
                list.IASetVertexBuffers(*first, Some(&native));
            }
            Command::SetIndexBuffer(view) => {
                let native = view.map(|view| D3D12_INDEX_BUFFER_VIEW {
                    BufferLocation: view.address.0,
                    SizeInBytes: view.size,
                    Format: match view.format {
                        IndexFormat::U16 => DXGI_FORMAT_R16_UINT,
                        IndexFormat::U32 => DXGI_FORMAT_R32_UINT,
                    },
                });
                list.IASetIndexBuffer(native.as_ref().map(|view| view as *const _));
            }
            Command::SetBlendFactor(factor) => list.OMSetBlendFactor(Some(factor)),
            Command::SetStencilRef(reference) => list.OMSetStencilRef(u32::from(*reference)),
            Command::ClearRenderTarget { view, color } => {
                list.ClearRenderTargetView(cpu_handle(*view), color.as_ptr(), &[]);
            }
            Command::ClearDepthStencil {
                view,
                flags,
                depth,
                stencil,
            } => {
                let mut native = D3D12_CLEAR_FLAGS(0);
                if flags.depth {
                    native |= D3D12_CLEAR_FLAG_DEPTH;
                }
                if flags.stencil {
                    native |= D3D12_CLEAR_FLAG_STENCIL;
                }
                list.ClearDepthStencilView(cpu_handle(*view), native, *depth, *stencil, &[]);
            }
            Command::DiscardResource(resource) => {
                if let Some(resource) = objects.resource(*resource) {
                    list.DiscardResource(resource, None);
                }
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                if let (Some(dst), Some(src)) = (objects.resource(*dst), objects.resource(*src)) {
                    list.CopyBufferRegion(dst, *dst_offset, src, *src_offset, *size);
                }
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
            } => list.DrawInstanced(*vertex_count, *instance_count, *first_vertex, 0),
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
            } => list.DrawIndexedInstanced(
                *index_count,
                *instance_count,
                *first_index,
                *base_vertex,
                0,
            ),
            Command::Dispatch { x, y, z } => list.Dispatch(*x, *y, *z),
        }
    }
}

impl Backend for Dx12Backend {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer, Error> {
        let size = next_multiple_of(desc.size.max(1), CONSTANT_BUFFER_ALIGNMENT);
        let flags = if desc.writable {
            D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            D3D12_RESOURCE_FLAG_NONE
        };
        let default_state = desc.usage.default_state();

        let resource = self.create_resource(
            D3D12_HEAP_TYPE_DEFAULT,
            &buffer_desc(size, flags),
            convert::resource_state(default_state),
            None,
        )?;
        let address = GpuAddress(unsafe { resource.GetGPUVirtualAddress() });

        let id = ResourceId(self.objects.lock().resources.insert(resource).to_bits());
        Ok(Buffer {
            id,
            address,
            size: desc.size,
            usage: desc.usage,
            default_state,
        })
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Texture, Error> {
        let mut flags = D3D12_RESOURCE_FLAG_NONE;
        if desc.render_target {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
        }
        if desc.depth_stencil {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        }
        if desc.unordered_access {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
        }

        let clear_value = if desc.depth_stencil {
            Some(D3D12_CLEAR_VALUE {
                Format: convert::pixel_format(desc.format),
                Anonymous: D3D12_CLEAR_VALUE_0 {
                    DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                        Depth: 1.0,
                        Stencil: 0,
                    },
                },
            })
        } else if desc.render_target {
            Some(D3D12_CLEAR_VALUE {
                Format: convert::pixel_format(desc.format),
                Anonymous: D3D12_CLEAR_VALUE_0 { Color: [0.0; 4] },
            })
        } else {
            None
        };

        let default_state = desc.default_state();
        let resource = self.create_resource(
            D3D12_HEAP_TYPE_DEFAULT,
            &D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Alignment: 0,
                Width: u64::from(desc.width.max(1)),
                Height: desc.height.max(1),
                DepthOrArraySize: 1,
                MipLevels: desc.mip_levels.clamp(1, u32::from(u16::MAX)) as u16,
                Format: convert::typeless_depth_format(desc.format),
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: flags,
            },
            convert::resource_state(default_state),
            clear_value.as_ref(),
        )?;

        let id = ResourceId(self.objects.lock().resources.insert(resource).to_bits());
        Ok(Texture {
            id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            default_state,
        })
    }

    fn create_upload_buffer(&self, size: u64) -> Result<UploadBuffer, Error> {
        let resource = self.create_resource(
            D3D12_HEAP_TYPE_UPLOAD,
            &buffer_desc(size, D3D12_RESOURCE_FLAG_NONE),
            D3D12_RESOURCE_STATE_GENERIC_READ,
            None,
        )?;

        let mut ptr = std::ptr::null_mut();
        // An empty read range: the CPU never reads upload memory.
        unsafe { resource.Map(0, Some(&D3D12_RANGE { Begin: 0, End: 0 }), Some(&mut ptr)) }
            .check("ID3D12Resource::Map")?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Error::Backend {
            call: "ID3D12Resource::Map",
            code: 0,
        })?;
        let address = GpuAddress(unsafe { resource.GetGPUVirtualAddress() });

        let id = ResourceId(self.objects.lock().resources.insert(resource).to_bits());
        Ok(UploadBuffer {
            resource: id,
            ptr,
            address,
            size,
        })
    }

    fn destroy_resource(&self, resource: ResourceId) {
        if remove(&mut self.objects.lock().resources, resource.0).is_none() {
            log::warn!("{resource:?} destroyed twice");
        }
    }

    fn create_view(&self, desc: &ViewDesc) -> Result<CpuDescriptor, Error> {
        let objects = self.objects.lock();
        let mut descriptors = self.descriptors.lock();
        let device = &self.dx.device;

        let handle = match *desc {
            ViewDesc::ConstantBuffer { address, size, .. } => {
                let handle = descriptors.views.allocate(device)?;
                let size = next_multiple_of(u64::from(size), CONSTANT_BUFFER_ALIGNMENT);
                unsafe {
                    device.CreateConstantBufferView(
                        Some(&D3D12_CONSTANT_BUFFER_VIEW_DESC {
                            BufferLocation: address.0,
                            SizeInBytes: size as u32,
                        }),
                        handle,
                    );
                }
                handle
            }
            ViewDesc::ShaderResource { resource, format } => {
                let resource = objects.resource(resource).ok_or(Error::InvalidHandle)?;
                let native = unsafe { resource.GetDesc() };
                let view = if native.Dimension == D3D12_RESOURCE_DIMENSION_BUFFER {
                    D3D12_SHADER_RESOURCE_VIEW_DESC {
                        Format: DXGI_FORMAT_R32_TYPELESS,
                        ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                            Buffer: D3D12_BUFFER_SRV {
                                FirstElement: 0,
                                NumElements: (native.Width / 4) as u32,
                                StructureByteStride: 0,
                                Flags: D3D12_BUFFER_SRV_FLAG_RAW,
                            },
                        },
                    }
                } else {
                    D3D12_SHADER_RESOURCE_VIEW_DESC {
                        Format: if format.is_depth() {
                            convert::depth_read_format(format)
                        } else if format == PixelFormat::Unknown {
                            native.Format
                        } else {
                            convert::pixel_format(format)
                        },
                        ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_SRV {
                                MostDetailedMip: 0,
                                MipLevels: u32::from(native.MipLevels),
                                PlaneSlice: 0,
                                ResourceMinLODClamp: 0.0,
                            },
                        },
                    }
                };

                let handle = descriptors.views.allocate(device)?;
                unsafe { device.CreateShaderResourceView(resource, Some(&view), handle) };
                handle
            }
            ViewDesc::UnorderedAccess { resource, format } => {
                let resource = objects.resource(resource).ok_or(Error::InvalidHandle)?;
                let native = unsafe { resource.GetDesc() };
                let view = if native.Dimension == D3D12_RESOURCE_DIMENSION_BUFFER {
                    D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: DXGI_FORMAT_R32_TYPELESS,
                        ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Buffer: D3D12_BUFFER_UAV {
                                FirstElement: 0,
                                NumElements: (native.Width / 4) as u32,
                                StructureByteStride: 0,
                                CounterOffsetInBytes: 0,
                                Flags: D3D12_BUFFER_UAV_FLAG_RAW,
                            },
                        },
                    }
                } else {
                    D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: if format == PixelFormat::Unknown {
                            native.Format
                        } else {
                            convert::pixel_format(format)
                        },
                        ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_UAV {
                                MipSlice: 0,
                                PlaneSlice: 0,
                            },
                        },
                    }
                };

                let handle = descriptors.views.allocate(device)?;
                unsafe {
                    device.CreateUnorderedAccessView(
                        resource,
                        None::<&ID3D12Resource>,
                        Some(&view),
                        handle,
                    );
                }
                handle
            }
            ViewDesc::RenderTarget { resource, format } => {
                let resource = objects.resource(resource).ok_or(Error::InvalidHandle)?;
                let handle = descriptors.render_targets.allocate(device)?;
                let view = D3D12_RENDER_TARGET_VIEW_DESC {
                    Format: convert::pixel_format(format),
                    ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                    Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_RTV {
                            MipSlice: 0,
                            PlaneSlice: 0,
                        },
                    },
                };
                unsafe {
                    device.CreateRenderTargetView(
                        resource,
                        (format != PixelFormat::Unknown).then_some(&view as *const _),
                        handle,
                    );
                }
                handle
            }
            ViewDesc::DepthStencil { resource, format } => {
                let resource = objects.resource(resource).ok_or(Error::InvalidHandle)?;
                let handle = descriptors.depth_stencils.allocate(device)?;
                unsafe {
                    device.CreateDepthStencilView(
                        resource,
                        Some(&D3D12_DEPTH_STENCIL_VIEW_DESC {
                            Format: convert::pixel_format(format),
                            ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                            Flags: D3D12_DSV_FLAG_NONE,
                            Anonymous: D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                                Texture2D: D3D12_TEX2D_DSV { MipSlice: 0 },
                            },
                        }),
                        handle,
                    );
                }
                handle
            }
        };

        Ok(CpuDescriptor(handle.ptr as u64))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<CpuDescriptor, Error> {
        let handle = self.descriptors.lock().samplers.allocate(&self.dx.device)?;
        unsafe { self.dx.device.CreateSampler(&convert::sampler(desc), handle) };
        Ok(CpuDescriptor(handle.ptr as u64))
    }

    fn destroy_view(&self, descriptor: CpuDescriptor) {
        self.descriptors.lock().free(descriptor);
    }

    fn null_descriptor(&self, family: BindingFamily) -> CpuDescriptor {
        let index = BindingFamily::ALL
            .iter()
            .position(|f| *f == family)
            .unwrap_or_default();
        self.null_descriptors[index]
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeap, Error> {
        let native_kind = match kind {
            DescriptorHeapKind::View => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            DescriptorHeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        };

        let heap: ID3D12DescriptorHeap = unsafe {
            self.dx.device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: native_kind,
                NumDescriptors: capacity,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                NodeMask: 0,
            })
        }
        .check("CreateDescriptorHeap")?;

        let cpu_start = CpuDescriptor(unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr as u64);
        let gpu_start = GpuDescriptor(unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr);
        let increment = unsafe { self.dx.device.GetDescriptorHandleIncrementSize(native_kind) };

        let id = HeapId(self.objects.lock().heaps.insert(heap).to_bits());
        log::debug!("created shader-visible {kind:?} heap with {capacity} descriptors");

        Ok(DescriptorHeap {
            id,
            kind,
            cpu_start,
            gpu_start,
            increment,
            capacity,
        })
    }

    fn destroy_descriptor_heap(&self, heap: HeapId) {
        remove(&mut self.objects.lock().heaps, heap.0);
    }

    fn copy_descriptors(&self, kind: DescriptorHeapKind, dst: CpuDescriptor, src: &[CpuDescriptor]) {
        let (native_kind, increment) = {
            let descriptors = self.descriptors.lock();
            match kind {
                DescriptorHeapKind::View => (
                    D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                    descriptors.views.increment(),
                ),
                DescriptorHeapKind::Sampler => (
                    D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
                    descriptors.samplers.increment(),
                ),
            }
        };

        // Copy runs of adjacent source descriptors in one call.
        let mut start = 0;
        while start < src.len() {
            let mut end = start + 1;
            while end < src.len() && src[end] == src[end - 1].offset(1, increment) {
                end += 1;
            }

            unsafe {
                self.dx.device.CopyDescriptorsSimple(
                    (end - start) as u32,
                    cpu_handle(dst.offset(start as u32, increment)),
                    cpu_handle(src[start]),
                    native_kind,
                );
            }
            start = end;
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId, Error> {
        let pipeline = pipeline::create(&self.dx.device, &self.root_signatures, desc)?;
        Ok(PipelineId(self.objects.lock().pipelines.insert(pipeline).to_bits()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        remove(&mut self.objects.lock().pipelines, pipeline.0);
    }

    fn create_command_allocator(&self) -> Result<AllocatorId, Error> {
        let allocator: ID3D12CommandAllocator =
            unsafe { self.dx.device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .check("CreateCommandAllocator")?;
        Ok(AllocatorId(self.objects.lock().allocators.insert(allocator).to_bits()))
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> Result<(), Error> {
        let objects = self.objects.lock();
        let allocator = lookup(&objects.allocators, allocator.0).ok_or(Error::InvalidHandle)?;
        unsafe { allocator.Reset() }.check("ID3D12CommandAllocator::Reset")
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        remove(&mut self.objects.lock().allocators, allocator.0);
    }

    fn create_command_list(&self, allocator: AllocatorId) -> Result<CommandListId, Error> {
        let mut objects = self.objects.lock();
        let allocator = lookup(&objects.allocators, allocator.0).ok_or(Error::InvalidHandle)?;

        let list: ID3D12GraphicsCommandList = unsafe {
            self.dx
                .device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, allocator, None)
        }
        .check("CreateCommandList")?;

        Ok(CommandListId(objects.lists.insert(list).to_bits()))
    }

    fn reset_command_list(&self, list: CommandListId, allocator: AllocatorId) -> Result<(), Error> {
        let objects = self.objects.lock();
        let list = lookup(&objects.lists, list.0).ok_or(Error::InvalidHandle)?;
        let allocator = lookup(&objects.allocators, allocator.0).ok_or(Error::InvalidHandle)?;
        unsafe { list.Reset(allocator, None) }.check("ID3D12GraphicsCommandList::Reset")
    }

    fn close_command_list(&self, list: CommandListId) -> Result<(), Error> {
        let objects = self.objects.lock();
        let list = lookup(&objects.lists, list.0).ok_or(Error::InvalidHandle)?;
        unsafe { list.Close() }.check("ID3D12GraphicsCommandList::Close")
    }

    fn destroy_command_list(&self, list: CommandListId) {
        remove(&mut self.objects.lock().lists, list.0);
    }

    fn encode(&self, list: CommandListId, command: &Command) {
        let objects = self.objects.lock();
        match lookup(&objects.lists, list.0) {
            Some(native) => unsafe { self.record(&objects, native, command) },
            None => log::error!("{list:?} does not refer to a live command list"),
        }
    }

    fn execute(&self, list: CommandListId) {
        let objects = self.objects.lock();
        match lookup(&objects.lists, list.0) {
            Some(native) => self.queue.execute(native),
            None => log::error!("{list:?} does not refer to a live command list"),
        }
    }

    fn signal(&self, value: u64) -> Result<(), Error> {
        self.queue.signal(value)
    }

    fn completed_value(&self) -> u64 {
        self.queue.completed_value()
    }

    fn wait_for_value(&self, value: u64) -> Result<(), Error> {
        self.queue.wait_for_value(value)
    }

    fn create_swap_chain(
        &self,
        window: RawWindowHandle,
        desc: &SwapChainDesc,
    ) -> Result<SwapChain, Error> {
        let native = swap_chain::create(
            &self.dx,
            &self.queue,
            window,
            desc.width,
            desc.height,
            desc.format,
            desc.buffer_count,
        )?;
        let (width, height) = swap_chain::size(&native)?;

        let mut objects = self.objects.lock();
        let back_buffers = self.acquire_back_buffers(&mut objects.resources, &native, desc.format)?;

        let entry = swap_chain::Entry {
            swap_chain: native,
            format: desc.format,
            width,
            height,
            back_buffers,
        };
        let handle = objects.swap_chains.insert(entry);
        let id = SwapChainId(handle.to_bits());

        let entry = objects.swap_chains.get(handle).ok_or(Error::InvalidHandle)?;
        Ok(Self::describe_swap_chain(id, entry))
    }

    fn resize_swap_chain(
        &self,
        swap_chain: SwapChainId,
        desc: &SwapChainDesc,
    ) -> Result<SwapChain, Error> {
        let mut objects = self.objects.lock();
        let Objects {
            resources,
            swap_chains,
            ..
        } = &mut *objects;

        let entry = Handle::from_bits(swap_chain.0)
            .and_then(|handle| swap_chains.get_mut(handle))
            .ok_or(Error::InvalidHandle)?;

        // Every reference to the old back buffers must be gone before
        // ResizeBuffers.
        self.release_back_buffers(resources, &mut entry.back_buffers);
        swap_chain::resize(&entry.swap_chain, desc.width, desc.height, desc.buffer_count)?;

        let (width, height) = swap_chain::size(&entry.swap_chain)?;
        entry.width = width;
        entry.height = height;
        entry.back_buffers = self.acquire_back_buffers(resources, &entry.swap_chain, entry.format)?;

        Ok(Self::describe_swap_chain(swap_chain, entry))
    }

    fn present(&self, swap_chain: SwapChainId, sync_interval: u32) -> Result<(), Error> {
        let objects = self.objects.lock();
        let entry = lookup(&objects.swap_chains, swap_chain.0).ok_or(Error::InvalidHandle)?;
        unsafe { entry.swap_chain.Present(sync_interval, 0) }
            .ok()
            .check("IDXGISwapChain::Present")
    }

    fn current_back_buffer(&self, swap_chain: SwapChainId) -> u32 {
        let objects = self.objects.lock();
        lookup(&objects.swap_chains, swap_chain.0)
            .map_or(0, |entry| unsafe { entry.swap_chain.GetCurrentBackBufferIndex() })
    }

    fn destroy_swap_chain(&self, swap_chain: SwapChainId) {
        let mut objects = self.objects.lock();
        if let Some(mut entry) = remove(&mut objects.swap_chains, swap_chain.0) {
            self.release_back_buffers(&mut objects.resources, &mut entry.back_buffers);
        }
    }
}

impl Drop for Dx12Backend {
    fn drop(&mut self) {
        let descriptors = self.descriptors.get_mut();
        let leaked = descriptors.views.allocated() + descriptors.samplers.allocated()
            + descriptors.render_targets.allocated()
            + descriptors.depth_stencils.allocated();
        // The null descriptors are never freed.
        if leaked > 5 {
            log::debug!("{} descriptors outstanding at shutdown", leaked - 5);
        }
    }
}
