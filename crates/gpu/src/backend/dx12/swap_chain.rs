use raw_window_handle::RawWindowHandle;
use smallvec::SmallVec;
use windows::{
    core::ComInterface,
    Win32::{
        Foundation::HWND,
        Graphics::{
            Direct3D12::ID3D12Resource,
            Dxgi::{Common::*, *},
        },
    },
};

use crate::{
    resource::{CpuDescriptor, ResourceId},
    types::PixelFormat,
    Error,
};

use super::{convert, interfaces::Interfaces, queue::Queue, Check};

pub struct Entry {
    pub swap_chain: IDXGISwapChain3,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// The back buffers and their render target views, in buffer order.
    pub back_buffers: SmallVec<[(ResourceId, CpuDescriptor); 3]>,
}

/// Flip-model swap chains can't hold sRGB buffers. The sRGB conversion is
/// applied through the render target view instead.
pub fn buffer_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::R8G8B8A8UnormSrgb => DXGI_FORMAT_R8G8B8A8_UNORM,
        other => convert::pixel_format(other),
    }
}

pub fn create(
    dx: &Interfaces,
    queue: &Queue,
    window: RawWindowHandle,
    width: u32,
    height: u32,
    format: PixelFormat,
    buffer_count: u32,
) -> Result<IDXGISwapChain3, Error> {
    let RawWindowHandle::Win32(handle) = window else {
        log::error!("unsupported window handle {window:?}");
        return Err(Error::UnsupportedWindow);
    };
    let hwnd = HWND(handle.hwnd as _);

    let swap_chain = unsafe {
        dx.gi.CreateSwapChainForHwnd(
            &queue.queue,
            hwnd,
            &DXGI_SWAP_CHAIN_DESC1 {
                // zero matches the size of the window
                Width: width,
                Height: height,
                Format: buffer_format(format),
                Stereo: false.into(),
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                BufferCount: buffer_count,
                Scaling: DXGI_SCALING_STRETCH,
                SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                AlphaMode: DXGI_ALPHA_MODE_IGNORE,
                Flags: 0,
            },
            None,
            None,
        )
    }
    .check("CreateSwapChainForHwnd")?
    .cast::<IDXGISwapChain3>()
    .check("IDXGISwapChain1::cast")?;

    // Disable fullscreen transitions
    unsafe { dx.gi.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }
        .check("MakeWindowAssociation")?;

    Ok(swap_chain)
}

pub fn resize(
    swap_chain: &IDXGISwapChain3,
    width: u32,
    height: u32,
    buffer_count: u32,
) -> Result<(), Error> {
    unsafe { swap_chain.ResizeBuffers(buffer_count, width, height, DXGI_FORMAT_UNKNOWN, 0) }
        .check("ResizeBuffers")
}

/// The actual size of the back buffers, which differs from the requested
/// size when that was zero.
pub fn size(swap_chain: &IDXGISwapChain3) -> Result<(u32, u32), Error> {
    let desc = unsafe { swap_chain.GetDesc1() }.check("GetDesc1")?;
    Ok((desc.Width, desc.Height))
}

pub fn buffers(swap_chain: &IDXGISwapChain3) -> Result<Vec<ID3D12Resource>, Error> {
    let desc = unsafe { swap_chain.GetDesc1() }.check("GetDesc1")?;
    (0..desc.BufferCount)
        .map(|i| unsafe { swap_chain.GetBuffer::<ID3D12Resource>(i) }.check("GetBuffer"))
        .collect()
}
