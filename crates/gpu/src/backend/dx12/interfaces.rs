use windows::{
    core::{ComInterface, PCSTR},
    Win32::Graphics::{Direct3D::D3D_FEATURE_LEVEL_11_0, Direct3D12::*, Dxgi::*},
};

use crate::{BackendConfig, Error, PowerPreference};

use super::Check;

pub struct Interfaces {
    pub is_debug: bool,
    pub gi: IDXGIFactory6,
    pub device: ID3D12Device,
}

impl Interfaces {
    pub fn new(config: &BackendConfig) -> Result<Self, Error> {
        let is_debug = config.debug_enabled();

        // Use IDXGIFactory6 for power preferece selection
        let gi: IDXGIFactory6 = {
            let flags = if is_debug { DXGI_CREATE_FACTORY_DEBUG } else { 0 };
            unsafe { CreateDXGIFactory2(flags) }.check("CreateDXGIFactory2")?
        };

        let power_preference = match config.power_preference {
            PowerPreference::LowPower => DXGI_GPU_PREFERENCE_MINIMUM_POWER,
            PowerPreference::HighPerformance => DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
        };

        let adapter: IDXGIAdapter = unsafe { gi.EnumAdapterByGpuPreference(0, power_preference) }
            .or_else(|_| {
                log::warn!("no hardware adapter available, falling back to WARP");
                unsafe { gi.EnumWarpAdapter() }
            })
            .check("EnumAdapterByGpuPreference")?;

        if is_debug {
            let mut dx_debug: Option<ID3D12Debug> = None;
            unsafe { D3D12GetDebugInterface(&mut dx_debug) }.check("D3D12GetDebugInterface")?;
            if let Some(dx_debug) = dx_debug {
                unsafe { dx_debug.EnableDebugLayer() };
            }
        }

        let device = {
            let mut device: Option<ID3D12Device> = None;
            unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }
                .check("D3D12CreateDevice")?;
            device.ok_or(Error::Backend {
                call: "D3D12CreateDevice",
                code: 0,
            })?
        };

        if is_debug {
            // The callback interface only exists on newer runtimes.
            match device.cast::<ID3D12InfoQueue1>() {
                Ok(queue) => {
                    let mut cookie = 0;
                    unsafe {
                        queue.RegisterMessageCallback(
                            Some(d3d12_debug_callback),
                            D3D12_MESSAGE_CALLBACK_IGNORE_FILTERS,
                            std::ptr::null(),
                            &mut cookie,
                        )
                    }
                    .check("RegisterMessageCallback")?;
                }
                Err(_) => log::warn!("ID3D12InfoQueue1 unavailable; debug messages won't be logged"),
            }
        }

        log::info!("created Direct3D 12 device (debug: {is_debug})");

        Ok(Self {
            is_debug,
            gi,
            device,
        })
    }
}

impl Drop for Interfaces {
    fn drop(&mut self) {
        if self.is_debug {
            if let Ok(dxgi_debug) = unsafe { DXGIGetDebugInterface1::<IDXGIDebug1>(0) } {
                let _ = unsafe {
                    dxgi_debug.ReportLiveObjects(
                        DXGI_DEBUG_ALL,
                        DXGI_DEBUG_RLO_SUMMARY | DXGI_DEBUG_RLO_IGNORE_INTERNAL,
                    )
                };
            }
        }
    }
}

extern "system" fn d3d12_debug_callback(
    _category: D3D12_MESSAGE_CATEGORY,
    severity: D3D12_MESSAGE_SEVERITY,
    id: D3D12_MESSAGE_ID,
    description: PCSTR,
    _context: *mut std::ffi::c_void,
) {
    let level = match severity {
        D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => log::Level::Error,
        D3D12_MESSAGE_SEVERITY_WARNING => log::Level::Warn,
        D3D12_MESSAGE_SEVERITY_INFO => log::Level::Info,
        _ => log::Level::Debug,
    };

    log::log!(target: "d3d12", level, "{:?} {}", id, unsafe { description.display() });
}
