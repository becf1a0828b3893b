use parking_lot::Mutex;
#[allow(clippy::wildcard_imports)]
use windows::{
    core::ComInterface,
    w,
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        Graphics::Direct3D12::*,
        System::Threading::{CreateEventW, WaitForSingleObject},
    },
};

use crate::Error;

use super::{interfaces::Interfaces, Check};

/// The direct queue and its fence. Fence values are chosen by the caller
/// and must increase monotonically.
pub struct Queue {
    pub queue: ID3D12CommandQueue,
    fence: ID3D12Fence,
    /// Guards the event as well as the handle; only one thread may wait on
    /// it at a time.
    event: Mutex<HANDLE>,
}

impl Queue {
    pub fn new(dx: &Interfaces) -> Result<Self, Error> {
        let queue: ID3D12CommandQueue = unsafe {
            dx.device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }
        .check("CreateCommandQueue")?;

        let fence: ID3D12Fence =
            unsafe { dx.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }.check("CreateFence")?;

        #[cfg(debug_assertions)]
        if dx.is_debug {
            unsafe {
                let _ = queue.SetName(w!("Direct Queue"));
                let _ = fence.SetName(w!("Direct Queue Fence"));
            }
        }

        let event = unsafe { CreateEventW(None, false, false, None) }.check("CreateEventW")?;

        Ok(Self {
            queue,
            fence,
            event: Mutex::new(event),
        })
    }

    pub fn execute(&self, list: &ID3D12GraphicsCommandList) {
        match list.cast::<ID3D12CommandList>() {
            Ok(list) => unsafe { self.queue.ExecuteCommandLists(&[Some(list)]) },
            Err(e) => log::error!("command list is not executable: {e}"),
        }
    }

    pub fn signal(&self, value: u64) -> Result<(), Error> {
        unsafe { self.queue.Signal(&self.fence, value) }.check("ID3D12CommandQueue::Signal")
    }

    pub fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    pub fn wait_for_value(&self, value: u64) -> Result<(), Error> {
        if self.completed_value() >= value {
            return Ok(());
        }

        let event = self.event.lock();
        unsafe { self.fence.SetEventOnCompletion(value, *event) }
            .check("SetEventOnCompletion")?;
        unsafe { WaitForSingleObject(*event, u32::MAX) };
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(*self.event.get_mut()) };
    }
}
