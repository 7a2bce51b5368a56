//! GPU telemetry through NVML.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use nvml_wrapper_sys::bindings::nvmlDevice_t;

use crate::units::{Energy, Power};

use super::{DeviceError, GpuInfo, GpuPowerMeter, GpuProcessUtilization, GpuZone};

/// One NVML device.
///
/// The library must be initialized and alive (not dropped), otherwise the
/// handle no longer works; the `Arc` keeps it alive without putting a
/// lifetime on the struct.
struct NvmlGpuZone {
    lib: Arc<Nvml>,
    handle: nvmlDevice_t,
    info: GpuInfo,
    has_instant_power: bool,
    /// Timestamp (µs) of the newest utilization sample seen, passed back
    /// to NVML so each query only returns fresh samples.
    last_util_timestamp: u64,
}

// The pointer `nvmlDevice_t` returned by NVML can be sent between threads.
// NVML is thread-safe according to its documentation.
unsafe impl Send for NvmlGpuZone {}

impl NvmlGpuZone {
    fn as_wrapper(&self) -> Device<'_> {
        unsafe { Device::new(self.handle, &self.lib) }
    }
}

impl GpuZone for NvmlGpuZone {
    fn device_id(&self) -> u32 {
        self.info.device_id
    }

    fn info(&self) -> &GpuInfo {
        &self.info
    }

    fn max_energy(&self) -> Energy {
        // NVML publishes no wrap constant for the cumulative counter.
        Energy::from_micro_joules(u64::MAX)
    }

    fn energy(&mut self) -> Result<Energy, DeviceError> {
        // the counter is in milliJoules
        let milli_joules = self
            .as_wrapper()
            .total_energy_consumption()
            .map_err(|e| DeviceError::Gpu(format!("gpu {}: {e}", self.info.device_id)))?;
        Ok(Energy::from_milli_joules(milli_joules))
    }
}

/// GPU power meter backed by NVML.
pub struct NvmlMeter {
    zones: Vec<NvmlGpuZone>,
    /// Per-(pid, gpu) SM utilization, refreshed once per collection tick.
    utilization: HashMap<(i32, u32), GpuProcessUtilization>,
    started: bool,
}

impl NvmlMeter {
    /// Initializes NVML and probes the available devices.
    ///
    /// Devices without a readable energy counter are skipped with a
    /// warning; an error is returned only if no usable device remains.
    pub fn new() -> anyhow::Result<NvmlMeter> {
        let lib = Arc::new(Nvml::init().context(
            "NVML initialization failed, please check your driver (do you have a desktop/server NVIDIA GPU?)",
        )?);

        let count = lib.device_count().context("could not count NVML devices")?;
        let mut zones = Vec::with_capacity(count as usize);
        for i in 0..count {
            let device = match lib.device_by_index(i) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("Skipping GPU device {i} because of error: {e}");
                    continue;
                }
            };
            if let Err(e) = device.total_energy_consumption() {
                log::warn!("Skipping GPU device {i}: energy counter not readable: {e}");
                continue;
            }
            let has_instant_power = !matches!(device.power_usage(), Err(NvmlError::NotSupported));
            let uuid = device.uuid().with_context(|| format!("uuid of GPU {i}"))?;
            let name = device.name().with_context(|| format!("name of GPU {i}"))?;
            // Extract the device pointer because we manage the lifetimes ourselves.
            let handle = unsafe { device.handle() };
            zones.push(NvmlGpuZone {
                lib: lib.clone(),
                handle,
                info: GpuInfo {
                    device_id: i,
                    uuid,
                    name,
                    vendor: "nvidia".to_owned(),
                },
                has_instant_power,
                last_util_timestamp: 0,
            });
        }
        if zones.is_empty() {
            anyhow::bail!("{count} NVML devices found but none of them has a readable energy counter");
        }
        for z in &zones {
            log::info!("Found GPU {}: {} ({})", z.info.device_id, z.info.name, z.info.uuid);
        }
        Ok(NvmlMeter {
            zones,
            utilization: HashMap::new(),
            started: false,
        })
    }

    /// Pulls the per-process utilization samples of every device.
    fn refresh_utilization(&mut self) {
        self.utilization.clear();
        for zone in &mut self.zones {
            let gpu_id = zone.info.device_id;
            let samples = match zone.as_wrapper().process_utilization_stats(zone.last_util_timestamp) {
                Ok(samples) => samples,
                // no process used the GPU during the window
                Err(NvmlError::NotFound) => continue,
                Err(e) => {
                    log::warn!("Could not read process utilization of GPU {gpu_id}: {e}");
                    continue;
                }
            };
            for sample in samples {
                zone.last_util_timestamp = zone.last_util_timestamp.max(sample.timestamp);
                let pid = sample.pid as i32;
                // keep the newest sample per process
                self.utilization.insert(
                    (pid, gpu_id),
                    GpuProcessUtilization {
                        pid,
                        gpu_id,
                        sm_utilization: sample.sm_util as f64,
                        energy_consumed: Energy::ZERO,
                    },
                );
            }
        }
    }
}

impl GpuPowerMeter for NvmlMeter {
    fn name(&self) -> &str {
        "nvml"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.started = true;
        log::debug!("NVML meter started with {} device(s)", self.zones.len());
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.started = false;
        Ok(())
    }

    fn zones(&mut self) -> Result<Vec<&mut dyn GpuZone>, DeviceError> {
        self.refresh_utilization();
        Ok(self.zones.iter_mut().map(|z| z as &mut dyn GpuZone).collect())
    }

    fn device_power(&self, gpu_id: u32) -> Option<Power> {
        let zone = self.zones.iter().find(|z| z.info.device_id == gpu_id)?;
        if !zone.has_instant_power {
            return None;
        }
        match zone.as_wrapper().power_usage() {
            // the reading is in milliWatts
            Ok(milli_watts) => Some(Power::from_milli_watts(milli_watts as u64)),
            Err(e) => {
                log::warn!("Could not read instantaneous power of GPU {gpu_id}: {e}");
                None
            }
        }
    }

    fn process_utilization(&self, pid: i32, gpu_id: u32) -> Option<GpuProcessUtilization> {
        self.utilization.get(&(pid, gpu_id)).copied()
    }
}
