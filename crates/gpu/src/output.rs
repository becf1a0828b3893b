//! Window swap chains and their depth buffers.

use raw_window_handle::RawWindowHandle;

use crate::{
    backend::{Backend, SwapChain, SwapChainDesc},
    deletion::Retired,
    device::Device,
    resource::{DepthStencilView, RenderTargetView, TextureDesc},
    types::PixelFormat,
    Error,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VSyncMode {
    #[default]
    Off,
    /// Present waits for the vertical blank.
    On,
    /// Like `On`, with an extra back buffer so the CPU can run a frame
    /// further ahead.
    TripleBuffering,
}

impl VSyncMode {
    #[must_use]
    pub fn buffer_count(self) -> u32 {
        match self {
            Self::Off | Self::On => 2,
            Self::TripleBuffering => 3,
        }
    }

    #[must_use]
    pub fn sync_interval(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::On | Self::TripleBuffering => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputBufferDesc {
    /// Zero matches the window's client area.
    pub width: u32,
    /// Zero matches the window's client area.
    pub height: u32,
    pub format: PixelFormat,
    /// Creates a depth buffer matching the back buffers if set.
    pub depth_format: Option<PixelFormat>,
    pub vsync: VSyncMode,
}

impl Default for OutputBufferDesc {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::R8G8B8A8Unorm,
            depth_format: Some(PixelFormat::D24UnormS8Uint),
            vsync: VSyncMode::Off,
        }
    }
}

/// A presentable surface: a swap chain plus an optional depth buffer of the
/// same size. Bound to a context with
/// [`ImmediateContext::set_output_buffer`](crate::ImmediateContext::set_output_buffer),
/// it serves as the target whenever no render targets are bound.
pub struct OutputBuffer<'d, B: Backend> {
    device: &'d Device<B>,
    swap_chain: SwapChain,
    format: PixelFormat,
    depth_format: Option<PixelFormat>,
    depth: Option<DepthStencilView>,
    vsync: VSyncMode,
}

impl<'d, B: Backend> OutputBuffer<'d, B> {
    pub(crate) fn new(
        device: &'d Device<B>,
        window: RawWindowHandle,
        desc: &OutputBufferDesc,
    ) -> Result<Self, Error> {
        if desc.format.is_depth() || desc.depth_format.is_some_and(|f| !f.is_depth()) {
            log::error!(
                "invalid output buffer formats ({:?} / {:?})",
                desc.format,
                desc.depth_format
            );
            return Err(Error::InvalidArgument("invalid output buffer format"));
        }

        let swap_chain = device.backend().create_swap_chain(
            window,
            &SwapChainDesc {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                buffer_count: desc.vsync.buffer_count(),
            },
        )?;

        let mut output = Self {
            device,
            swap_chain,
            format: desc.format,
            depth_format: desc.depth_format,
            depth: None,
            vsync: desc.vsync,
        };
        output.create_depth_buffer()?;

        log::debug!(
            "created {}x{} output buffer with {} back buffers",
            output.width(),
            output.height(),
            output.swap_chain.back_buffers.len()
        );
        Ok(output)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.swap_chain.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.swap_chain.height
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[must_use]
    pub fn depth_format(&self) -> Option<PixelFormat> {
        self.depth_format
    }

    #[must_use]
    pub fn vsync(&self) -> VSyncMode {
        self.vsync
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.swap_chain.back_buffers.len()
    }

    #[must_use]
    pub fn current_back_buffer_index(&self) -> u32 {
        self.device
            .backend()
            .current_back_buffer(self.swap_chain.id)
    }

    /// The back buffer the next frame renders into.
    #[must_use]
    pub fn current_back_buffer(&self) -> RenderTargetView {
        let index = self.current_back_buffer_index() as usize;
        self.swap_chain.back_buffers[index % self.swap_chain.back_buffers.len()]
    }

    #[must_use]
    pub fn depth_stencil_view(&self) -> Option<DepthStencilView> {
        self.depth
    }

    pub(crate) fn present(&self) -> Result<(), Error> {
        self.device
            .backend()
            .present(self.swap_chain.id, self.vsync.sync_interval())
    }

    /// Whether switching to `vsync` changes the number of back buffers.
    pub(crate) fn vsync_needs_resize(&self, vsync: VSyncMode) -> bool {
        vsync.buffer_count() != self.vsync.buffer_count()
    }

    /// Changes the vsync mode without touching the back buffers. Only valid
    /// when [`Self::vsync_needs_resize`] is false.
    pub(crate) fn set_sync_interval(&mut self, vsync: VSyncMode) {
        debug_assert!(!self.vsync_needs_resize(vsync));
        self.vsync = vsync;
    }

    /// Recreates the back buffers and the depth buffer. The GPU must no longer
    /// be using any of them.
    pub(crate) fn resize(&mut self, width: u32, height: u32, vsync: VSyncMode) -> Result<(), Error> {
        self.release_depth_buffer();

        self.swap_chain = self.device.backend().resize_swap_chain(
            self.swap_chain.id,
            &SwapChainDesc {
                width,
                height,
                format: self.format,
                buffer_count: vsync.buffer_count(),
            },
        )?;
        self.vsync = vsync;

        log::debug!(
            "resized output buffer to {}x{} with {} back buffers",
            self.width(),
            self.height(),
            self.swap_chain.back_buffers.len()
        );

        self.create_depth_buffer()
    }

    fn create_depth_buffer(&mut self) -> Result<(), Error> {
        let Some(format) = self.depth_format else {
            return Ok(());
        };

        let texture = self.device.create_texture(&TextureDesc::depth_stencil(
            self.width(),
            self.height(),
            format,
        ))?;

        match self.device.create_depth_stencil_view(&texture) {
            Ok(view) => {
                self.depth = Some(view);
                Ok(())
            }
            Err(e) => {
                self.device.release_texture(texture);
                Err(e)
            }
        }
    }

    fn release_depth_buffer(&mut self) {
        if let Some(view) = self.depth.take() {
            let deletion = self.device.deletion_queue();
            deletion.retire(Retired::View(view.descriptor));
            deletion.retire(Retired::Resource(view.texture.id));
        }
    }
}

impl<B: Backend> Drop for OutputBuffer<'_, B> {
    fn drop(&mut self) {
        self.release_depth_buffer();
        self.device
            .backend()
            .destroy_swap_chain(self.swap_chain.id);
    }
}

impl<B: Backend> std::fmt::Debug for OutputBuffer<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("swap_chain", &self.swap_chain.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format)
            .field("depth_format", &self.depth_format)
            .field("vsync", &self.vsync)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use raw_window_handle::{RawWindowHandle, Win32WindowHandle};

    use super::*;
    use crate::{backend::recording::RecordingBackend, types::ResourceState, Config};

    pub(crate) fn window() -> RawWindowHandle {
        RawWindowHandle::Win32(Win32WindowHandle::empty())
    }

    pub(crate) fn desc(width: u32, height: u32) -> OutputBufferDesc {
        OutputBufferDesc {
            width,
            height,
            ..OutputBufferDesc::default()
        }
    }

    #[test]
    fn back_buffers_rest_in_present() {
        let device = Device::new(RecordingBackend::new(), Config::default());
        let output = device.create_output_buffer(window(), &desc(64, 32)).unwrap();

        assert_eq!(output.buffer_count(), 2);
        assert_eq!(
            output.current_back_buffer().texture.default_state,
            ResourceState::Present
        );

        let depth = output.depth_stencil_view().unwrap();
        assert_eq!((depth.texture.width, depth.texture.height), (64, 32));
    }

    #[test]
    fn resize_recreates_the_depth_buffer() {
        let device = Device::new(RecordingBackend::new(), Config::default());
        let mut output = device.create_output_buffer(window(), &desc(64, 32)).unwrap();
        let old_depth = output.depth_stencil_view().unwrap();

        output.resize(128, 96, VSyncMode::TripleBuffering).unwrap();
        assert_eq!((output.width(), output.height()), (128, 96));
        assert_eq!(output.buffer_count(), 3);

        let depth = output.depth_stencil_view().unwrap();
        assert_ne!(depth.texture.id, old_depth.texture.id);
        assert_eq!(device.deletion_queue().len(), 2);
    }

    #[test]
    fn vsync_changes_only_resize_for_triple_buffering() {
        let device = Device::new(RecordingBackend::new(), Config::default());
        let output = device.create_output_buffer(window(), &desc(8, 8)).unwrap();

        assert!(!output.vsync_needs_resize(VSyncMode::On));
        assert!(output.vsync_needs_resize(VSyncMode::TripleBuffering));
    }

    #[test]
    fn depth_formats_are_validated() {
        let device = Device::new(RecordingBackend::new(), Config::default());
        let desc = OutputBufferDesc {
            depth_format: Some(PixelFormat::R8G8B8A8Unorm),
            ..desc(8, 8)
        };
        assert!(matches!(
            device.create_output_buffer(window(), &desc),
            Err(Error::InvalidArgument(_))
        ));
    }
}
