//! Node-level power computation.

use std::time::Duration;

use anyhow::Context;

use crate::units::{Energy, Power};

use super::snapshot::{NodeUsage, Snapshot};
use super::PowerMonitor;

/// Difference between two readings of a monotonic, wrapping counter.
///
/// On wrap (`current < previous`) the delta is corrected with the
/// counter's maximum value; without a known maximum the delta is clamped
/// to zero, under-counting the interval instead of going negative.
pub(crate) fn calculate_energy_delta(current: Energy, previous: Energy, max_energy: Energy) -> Energy {
    if current >= previous {
        return current - previous;
    }
    if max_energy > Energy::ZERO {
        return max_energy.saturating_sub(previous) + current;
    }
    Energy::ZERO
}

impl PowerMonitor {
    pub(crate) fn calculate_node_power(&mut self, prev: &Snapshot, snapshot: &mut Snapshot) -> anyhow::Result<()> {
        let node_info = self.resources.node();
        let usage_ratio = node_info.cpu_usage_ratio.clamp(0.0, 1.0);
        snapshot.node.cpu_usage_ratio = usage_ratio;

        let dt = snapshot.timestamp.duration_since(prev.timestamp).unwrap_or_default();
        log::debug!(
            "calculating node power: usage ratio {usage_ratio:.3}, dt {:?}, cpu time delta {:.3}s",
            dt,
            node_info.process_total_cpu_time_delta,
        );

        let zones = self.cpu.zones().context("cannot enumerate CPU energy zones")?;
        for zone in zones {
            let id = zone.id();
            let abs_energy = match zone.energy() {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Could not read energy for zone {id}: {e}");
                    continue;
                }
            };

            let mut usage = NodeUsage {
                energy_total: abs_energy,
                ..Default::default()
            };
            if let Some(prev_zone) = prev.node.zones.get(&id) {
                let max_energy = zone.max_energy();
                if abs_energy < prev_zone.energy_total && max_energy == Energy::ZERO {
                    log::warn!("negative energy delta on zone {id} without a wrap value, clamping to zero");
                }
                let delta = calculate_energy_delta(abs_energy, prev_zone.energy_total, max_energy);

                let active_energy = delta.scale(usage_ratio);
                let idle_energy = delta - active_energy;
                usage.active_energy_total = prev_zone.active_energy_total + active_energy;
                usage.idle_energy_total = prev_zone.idle_energy_total + idle_energy;
                usage.active_energy_interval = active_energy;

                let power = delta.over(dt);
                usage.power = power;
                usage.active_power = power.scale(usage_ratio);
                usage.idle_power = power.saturating_sub(usage.active_power);
            }
            snapshot.node.zones.insert(id, usage);
        }

        if self.gpu.is_some() {
            self.collect_node_gpu(prev, snapshot, dt);
        }
        Ok(())
    }

    /// Reads all zones for the first time: energies are initialized from
    /// the absolute counters, split by the current usage ratio; no rate
    /// can be computed yet, so all powers stay zero.
    pub(crate) fn first_node_read(&mut self, snapshot: &mut Snapshot) -> anyhow::Result<()> {
        let usage_ratio = self.resources.node().cpu_usage_ratio.clamp(0.0, 1.0);
        snapshot.node.cpu_usage_ratio = usage_ratio;

        let zones = self.cpu.zones().context("cannot enumerate CPU energy zones")?;
        for zone in zones {
            let id = zone.id();
            let abs_energy = match zone.energy() {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Could not read energy for zone {id}: {e}");
                    continue;
                }
            };
            let active_energy = abs_energy.scale(usage_ratio);
            snapshot.node.zones.insert(
                id,
                NodeUsage {
                    energy_total: abs_energy,
                    active_energy_total: active_energy,
                    idle_energy_total: abs_energy - active_energy,
                    active_energy_interval: active_energy,
                    ..Default::default()
                },
            );
        }

        if self.gpu.is_some() {
            self.init_node_gpu(snapshot);
        }
        Ok(())
    }

    fn collect_node_gpu(&mut self, prev: &Snapshot, snapshot: &mut Snapshot, dt: Duration) {
        let Some(gpu) = self.gpu.as_mut() else { return };
        let zones = match gpu.zones() {
            Ok(zones) => zones,
            Err(e) => {
                // publish without GPU fields for this tick
                log::error!("Failed to get GPU zones: {e}");
                return;
            }
        };

        let mut usages = Vec::new();
        for zone in zones {
            let gpu_id = zone.device_id();
            let abs_energy = match zone.energy() {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Could not read energy for GPU {gpu_id}: {e}");
                    continue;
                }
            };

            let mut usage = NodeUsage {
                energy_total: abs_energy,
                ..Default::default()
            };
            if let Some(prev_usage) = prev.node.gpu_zones.get(&gpu_id) {
                let delta = calculate_energy_delta(abs_energy, prev_usage.energy_total, zone.max_energy());

                // the whole GPU delta counts as active: no idle split
                usage.active_energy_total = prev_usage.active_energy_total + delta;
                usage.idle_energy_total = prev_usage.idle_energy_total;
                usage.active_energy_interval = delta;
            }
            usages.push((gpu_id, zone.info().clone(), usage));
        }

        for (gpu_id, info, mut usage) in usages {
            if prev.node.gpu_zones.contains_key(&gpu_id) {
                // prefer the instantaneous reading, fall back to ΔE/Δt
                let power = match gpu.device_power(gpu_id) {
                    Some(power) => power,
                    None => usage.active_energy_interval.over(dt),
                };
                usage.power = power;
                usage.active_power = power;
                usage.idle_power = Power::ZERO;
            }
            snapshot.node.gpus.insert(gpu_id, info);
            snapshot.node.gpu_zones.insert(gpu_id, usage);
        }
    }

    fn init_node_gpu(&mut self, snapshot: &mut Snapshot) {
        let Some(gpu) = self.gpu.as_mut() else { return };
        let zones = match gpu.zones() {
            Ok(zones) => zones,
            Err(e) => {
                log::error!("Failed to get GPU zones: {e}");
                return;
            }
        };

        for zone in zones {
            let gpu_id = zone.device_id();
            let abs_energy = match zone.energy() {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("Could not read initial energy for GPU {gpu_id}: {e}");
                    Energy::ZERO
                }
            };
            snapshot.node.gpus.insert(gpu_id, zone.info().clone());
            snapshot.node.gpu_zones.insert(
                gpu_id,
                NodeUsage {
                    energy_total: abs_energy,
                    active_energy_total: abs_energy,
                    idle_energy_total: Energy::ZERO,
                    active_energy_interval: abs_energy,
                    ..Default::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ZoneId;

    #[test]
    fn delta_without_wrap() {
        let delta = calculate_energy_delta(
            Energy::from_micro_joules(1500),
            Energy::from_micro_joules(1000),
            Energy::from_micro_joules(u32::MAX as u64),
        );
        assert_eq!(delta, Energy::from_micro_joules(500));
    }

    #[test]
    fn delta_across_wrap() {
        let max = Energy::from_micro_joules(u32::MAX as u64);
        let prev = Energy::from_micro_joules(u32::MAX as u64 - 9);
        let now = Energy::from_micro_joules(40);
        assert_eq!(calculate_energy_delta(now, prev, max), Energy::from_micro_joules(49));
    }

    #[test]
    fn delta_clamped_without_max() {
        let delta = calculate_energy_delta(
            Energy::from_micro_joules(10),
            Energy::from_micro_joules(999),
            Energy::ZERO,
        );
        assert_eq!(delta, Energy::ZERO);
    }

    #[test]
    fn zone_id_display() {
        // labels use "name-index"
        assert_eq!(ZoneId::new("package", 1).to_string(), "package-1");
    }
}
