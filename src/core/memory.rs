//! Device memory measurement used to size the KV cache.

use candle_core::Device;
use sysinfo::System;

use crate::error::{Error, Result};

/// Memory snapshot of one device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    /// Total memory of the device.
    pub total: usize,
    /// Memory currently in use.
    pub allocated: usize,
}

impl DeviceMemory {
    /// Measure `device`.
    ///
    /// CPU numbers come from the host; CUDA numbers from the driver.
    pub fn measure(device: &Device) -> Result<Self> {
        match device {
            Device::Cpu => {
                let mut sys = System::new();
                sys.refresh_memory();
                let total = to_usize(sys.total_memory())?;
                let available = to_usize(sys.available_memory())?;
                Ok(Self {
                    total,
                    allocated: total.saturating_sub(available),
                })
            }
            #[cfg(feature = "cuda")]
            Device::Cuda(dev) => {
                use candle_core::backend::BackendDevice;
                use candle_core::cuda::cudarc::driver::result;
                use candle_core::DeviceLocation;

                let DeviceLocation::Cuda { gpu_id } = dev.location() else {
                    return Err(Error::UnsupportedDevice(format!("{:?}", dev.location())));
                };
                let driver_err =
                    |e: result::DriverError| Error::InsufficientMemory(format!("cuda driver: {e:?}"));

                // mem_get_info reports on the current context, which is whichever
                // device was touched last on this thread.
                let original_ctx = result::ctx::get_current().map_err(driver_err)?;
                let cu_device = result::device::get(gpu_id as i32).map_err(driver_err)?;
                let cu_ctx = unsafe { result::primary_ctx::retain(cu_device) }.map_err(driver_err)?;

                let info = unsafe { result::ctx::set_current(cu_ctx) }
                    .and_then(|()| result::mem_get_info());
                unsafe { result::primary_ctx::release(cu_device) }.map_err(driver_err)?;
                if let Some(ctx) = original_ctx {
                    unsafe { result::ctx::set_current(ctx) }.map_err(driver_err)?;
                }

                let (free, total) = info.map_err(driver_err)?;
                Ok(Self {
                    total,
                    allocated: total.saturating_sub(free),
                })
            }
            #[cfg(not(feature = "cuda"))]
            Device::Cuda(_) => Err(Error::UnsupportedDevice(
                "cuda (built without the `cuda` feature)".into(),
            )),
            Device::Metal(_) => Err(Error::UnsupportedDevice("metal".into())),
        }
    }

    /// Bytes the cache may take.
    ///
    /// On CPU the cap is used as is. On accelerators it is whatever fits under
    /// `total * max_memory_utilization` after current allocations, capped by
    /// `max_cache_size`.
    pub fn cache_budget(
        &self,
        device: &Device,
        max_cache_size: usize,
        max_memory_utilization: f64,
    ) -> usize {
        if device.is_cpu() {
            return max_cache_size;
        }
        let usable = (self.total as f64 * max_memory_utilization) as usize;
        usable.saturating_sub(self.allocated).min(max_cache_size)
    }
}

fn to_usize(bytes: u64) -> Result<usize> {
    usize::try_from(bytes).map_err(|e| Error::InsufficientMemory(e.to_string()))
}
