//! Fake meters for development and tests.
//!
//! The fakes implement the same traits as the hardware backends, so the
//! whole monitor can run on a machine without RAPL or NVML. Counters can
//! either advance by a fixed step on every read (dev mode) or be driven
//! explicitly through a [`FakeCpuHandle`] / [`FakeGpuHandle`] (tests).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::units::{Energy, Power};

use super::{
    CpuPowerMeter, DeviceError, EnergyZone, GpuInfo, GpuPowerMeter, GpuProcessUtilization, GpuZone,
};

#[derive(Debug)]
struct CpuZoneState {
    energy: Energy,
    step: Energy,
    fail: bool,
}

/// A fake CPU energy zone with a scriptable counter.
pub struct FakeCpuZone {
    name: String,
    index: usize,
    max_energy: Energy,
    state: Arc<Mutex<CpuZoneState>>,
}

impl EnergyZone for FakeCpuZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> usize {
        self.index
    }

    fn path(&self) -> String {
        format!("fake:cpu:{}-{}", self.name, self.index)
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }

    fn energy(&mut self) -> Result<Energy, DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(DeviceError::Io {
                path: self.path(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        let next = Energy::from_micro_joules(
            (state.energy.as_micro_joules() + state.step.as_micro_joules())
                % self.max_energy.as_micro_joules().max(1),
        );
        state.energy = next;
        Ok(next)
    }
}

/// Fake CPU meter exposing one zone per configured spec.
pub struct FakeCpuMeter {
    zones: Vec<FakeCpuZone>,
}

/// Drives the counters of a [`FakeCpuMeter`] from outside the monitor.
#[derive(Clone)]
pub struct FakeCpuHandle {
    states: HashMap<(String, usize), Arc<Mutex<CpuZoneState>>>,
}

impl FakeCpuMeter {
    /// Creates a meter with the given zone names (one zone per name,
    /// index 0) advancing by `step` on every read.
    pub fn new(zone_names: &[String], step: Energy) -> FakeCpuMeter {
        let zones = zone_names
            .iter()
            .map(|name| FakeCpuZone {
                name: name.clone(),
                index: 0,
                max_energy: Energy::from_micro_joules(u64::MAX),
                state: Arc::new(Mutex::new(CpuZoneState {
                    energy: Energy::ZERO,
                    step,
                    fail: false,
                })),
            })
            .collect();
        FakeCpuMeter { zones }
    }

    /// Creates a meter with explicit zone identities and wrap values,
    /// counters frozen until driven through the handle.
    pub fn with_zones(specs: Vec<(String, usize, Energy)>) -> FakeCpuMeter {
        let zones = specs
            .into_iter()
            .map(|(name, index, max_energy)| FakeCpuZone {
                name,
                index,
                max_energy,
                state: Arc::new(Mutex::new(CpuZoneState {
                    energy: Energy::ZERO,
                    step: Energy::ZERO,
                    fail: false,
                })),
            })
            .collect();
        FakeCpuMeter { zones }
    }

    pub fn handle(&self) -> FakeCpuHandle {
        let states = self
            .zones
            .iter()
            .map(|z| ((z.name.clone(), z.index), z.state.clone()))
            .collect();
        FakeCpuHandle { states }
    }
}

impl FakeCpuHandle {
    /// Sets the absolute counter value of a zone.
    pub fn set_energy(&self, name: &str, index: usize, energy: Energy) {
        if let Some(state) = self.states.get(&(name.to_owned(), index)) {
            state.lock().unwrap().energy = energy;
        }
    }

    /// Adds `delta` to the counter of a zone (no wrap handling; tests
    /// exercising wrap set the absolute value instead).
    pub fn add_energy(&self, name: &str, index: usize, delta: Energy) {
        if let Some(state) = self.states.get(&(name.to_owned(), index)) {
            let mut state = state.lock().unwrap();
            state.energy += delta;
        }
    }

    /// Makes every read of the zone fail until reset.
    pub fn set_failing(&self, name: &str, index: usize, fail: bool) {
        if let Some(state) = self.states.get(&(name.to_owned(), index)) {
            state.lock().unwrap().fail = fail;
        }
    }
}

impl CpuPowerMeter for FakeCpuMeter {
    fn name(&self) -> &str {
        "fake-cpu"
    }

    fn zones(&mut self) -> Result<Vec<&mut dyn EnergyZone>, DeviceError> {
        Ok(self.zones.iter_mut().map(|z| z as &mut dyn EnergyZone).collect())
    }
}

#[derive(Debug, Default)]
struct GpuDeviceState {
    energy: Energy,
    energy_step: Energy,
    device_power: Option<Power>,
}

struct FakeGpuZone {
    info: GpuInfo,
    max_energy: Energy,
    state: Arc<Mutex<GpuDeviceState>>,
}

impl GpuZone for FakeGpuZone {
    fn device_id(&self) -> u32 {
        self.info.device_id
    }

    fn info(&self) -> &GpuInfo {
        &self.info
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }

    fn energy(&mut self) -> Result<Energy, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let next = Energy::from_micro_joules(
            (state.energy.as_micro_joules() + state.energy_step.as_micro_joules())
                % self.max_energy.as_micro_joules().max(1),
        );
        state.energy = next;
        Ok(next)
    }
}

type UtilizationMap = Arc<Mutex<HashMap<(i32, u32), GpuProcessUtilization>>>;

/// Fake GPU meter with scriptable device power and per-process SM
/// utilization.
pub struct FakeGpuMeter {
    zones: Vec<FakeGpuZone>,
    utilization: UtilizationMap,
    running: bool,
}

/// Drives a [`FakeGpuMeter`] from outside the monitor.
#[derive(Clone)]
pub struct FakeGpuHandle {
    devices: HashMap<u32, Arc<Mutex<GpuDeviceState>>>,
    utilization: UtilizationMap,
}

impl FakeGpuMeter {
    /// Creates a meter with the given device ids, counters advancing by
    /// `energy_step` on every read and reporting `device_power` as the
    /// instantaneous power.
    pub fn new(device_ids: &[u32], device_power: Option<Power>, energy_step: Energy) -> FakeGpuMeter {
        let ids: &[u32] = if device_ids.is_empty() { &[0] } else { device_ids };
        let zones = ids
            .iter()
            .map(|&id| FakeGpuZone {
                info: GpuInfo {
                    device_id: id,
                    uuid: format!("GPU-fake-{id:08}"),
                    name: format!("Fake GPU {id}"),
                    vendor: "fake".to_owned(),
                },
                max_energy: Energy::from_micro_joules(u64::MAX),
                state: Arc::new(Mutex::new(GpuDeviceState {
                    energy: Energy::ZERO,
                    energy_step,
                    device_power,
                })),
            })
            .collect();
        FakeGpuMeter {
            zones,
            utilization: Arc::new(Mutex::new(HashMap::new())),
            running: false,
        }
    }

    pub fn handle(&self) -> FakeGpuHandle {
        let devices = self
            .zones
            .iter()
            .map(|z| (z.info.device_id, z.state.clone()))
            .collect();
        FakeGpuHandle {
            devices,
            utilization: self.utilization.clone(),
        }
    }
}

impl FakeGpuHandle {
    pub fn set_energy(&self, gpu_id: u32, energy: Energy) {
        if let Some(state) = self.devices.get(&gpu_id) {
            state.lock().unwrap().energy = energy;
        }
    }

    pub fn set_device_power(&self, gpu_id: u32, power: Option<Power>) {
        if let Some(state) = self.devices.get(&gpu_id) {
            state.lock().unwrap().device_power = power;
        }
    }

    pub fn set_process_utilization(&self, pid: i32, gpu_id: u32, sm_utilization: f64) {
        self.utilization.lock().unwrap().insert(
            (pid, gpu_id),
            GpuProcessUtilization {
                pid,
                gpu_id,
                sm_utilization,
                energy_consumed: Energy::ZERO,
            },
        );
    }

    pub fn clear_process(&self, pid: i32, gpu_id: u32) {
        self.utilization.lock().unwrap().remove(&(pid, gpu_id));
    }
}

impl GpuPowerMeter for FakeGpuMeter {
    fn name(&self) -> &str {
        "fake-gpu"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.running = true;
        log::debug!("fake GPU meter started with {} device(s)", self.zones.len());
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.running = false;
        Ok(())
    }

    fn zones(&mut self) -> Result<Vec<&mut dyn GpuZone>, DeviceError> {
        Ok(self.zones.iter_mut().map(|z| z as &mut dyn GpuZone).collect())
    }

    fn device_power(&self, gpu_id: u32) -> Option<Power> {
        self.zones
            .iter()
            .find(|z| z.info.device_id == gpu_id)
            .and_then(|z| z.state.lock().unwrap().device_power)
    }

    fn process_utilization(&self, pid: i32, gpu_id: u32) -> Option<GpuProcessUtilization> {
        self.utilization.lock().unwrap().get(&(pid, gpu_id)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_counter_wraps_at_max_energy() {
        let mut meter = FakeCpuMeter::with_zones(vec![(
            "package".to_owned(),
            0,
            Energy::from_micro_joules(1000),
        )]);
        let handle = meter.handle();
        handle.set_energy("package", 0, Energy::from_micro_joules(990));
        let zone = &mut meter.zones[0];
        assert_eq!(zone.energy().unwrap(), Energy::from_micro_joules(990));
        handle.set_energy("package", 0, Energy::from_micro_joules(40));
        assert_eq!(zone.energy().unwrap(), Energy::from_micro_joules(40));
    }

    #[test]
    fn gpu_utilization_scripting() {
        let meter = FakeGpuMeter::new(&[0, 1], Some(Power::from_watts(100.0)), Energy::ZERO);
        let handle = meter.handle();
        handle.set_process_utilization(42, 0, 55.0);
        let util = meter.process_utilization(42, 0).unwrap();
        assert_eq!(util.sm_utilization, 55.0);
        assert!(meter.process_utilization(42, 1).is_none());
        handle.clear_process(42, 0);
        assert!(meter.process_utilization(42, 0).is_none());
    }
}
