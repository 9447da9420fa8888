//! D3D11 device wrapper.
//!
//! Holds the device, its immediate context and an event query used to wait
//! for submitted work before a shared surface is handed over.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use tracing::{debug, error, warn};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;

/// Longest time [`Dx11Device::wait_idle`] polls the event query.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// The presentation-side D3D11 device that owns shared render targets.
pub struct Dx11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    /// `D3D11_QUERY_EVENT` signaled after the last flush.
    gpu_query: ID3D11Query,
}

impl Dx11Device {
    /// Try a hardware device, then WARP so headless machines still get a
    /// presentation device.
    pub fn new() -> Result<Self> {
        let mut last_err = None;
        for driver in [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP] {
            match create_with_driver(driver) {
                Ok((device, context)) => {
                    debug!(?driver, "presentation device ready");
                    let gpu_query = create_event_query(&device)?;
                    return Ok(Self {
                        device,
                        context,
                        gpu_query,
                    });
                }
                Err(err) => {
                    debug!(?driver, "D3D11 driver unavailable: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no D3D11 driver type was tried"));
        error!("no D3D11 driver type could create a device: {err:#}");
        Err(err.context("D3D11 is unavailable"))
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    /// `Err` once the device has been removed or reset by the driver.
    pub fn check_removed(&self) -> windows::core::Result<()> {
        unsafe { self.device.GetDeviceRemovedReason() }
    }

    /// Flush the immediate context and wait (bounded) for the GPU to finish.
    pub fn wait_idle(&self) {
        let start = Instant::now();
        unsafe {
            self.context.End(&self.gpu_query);
            self.context.Flush();
            // GetData returns S_FALSE while the query is pending, which the
            // windows crate maps to Ok(()), so check the BOOL it writes.
            loop {
                let mut done: u32 = 0;
                let _ = self.context.GetData(
                    &self.gpu_query,
                    Some(&mut done as *mut u32 as *mut std::ffi::c_void),
                    std::mem::size_of::<u32>() as u32,
                    0,
                );
                if done != 0 {
                    break;
                }
                if start.elapsed() > IDLE_TIMEOUT {
                    warn!("GPU query timed out after {IDLE_TIMEOUT:?}, proceeding anyway");
                    break;
                }
                std::thread::yield_now();
            }
        }
    }
}

fn create_with_driver(driver: D3D_DRIVER_TYPE) -> Result<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDevice(
            None,
            driver,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&[D3D_FEATURE_LEVEL_11_0]),
            D3D11_SDK_VERSION,
            Some(&mut device as *mut _),
            None,
            Some(&mut context as *mut _),
        )
    }?;
    let device = device.context("D3D11CreateDevice returned no device")?;
    let context = context.context("D3D11CreateDevice returned no immediate context")?;
    Ok((device, context))
}

fn create_event_query(device: &ID3D11Device) -> Result<ID3D11Query> {
    let desc = D3D11_QUERY_DESC {
        Query: D3D11_QUERY_EVENT,
        ..Default::default()
    };
    let mut query = None;
    unsafe { device.CreateQuery(&desc, Some(&mut query as *mut _)) }?;
    query.context("CreateQuery returned no event query")
}
