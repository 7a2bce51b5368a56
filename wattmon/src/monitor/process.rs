//! Per-process attribution.
//!
//! CPU energy is attributed by each process's share of the node's CPU
//! time; GPU energy by its share of the reported SM utilization. Both
//! models preserve `Σ process power = node active power` by
//! construction.

use std::collections::HashMap;

use crate::resource::ProcessInfo;
use crate::units::{Energy, Power};

use super::snapshot::{GpuUsageMap, NodeZoneUsageMap, Process, Snapshot, Usage, ZoneUsageMap};
use super::PowerMonitor;

fn new_process_record(info: &ProcessInfo, zones: &NodeZoneUsageMap) -> Process {
    let mut process = Process {
        pid: info.pid,
        comm: info.comm.clone(),
        exe: info.exe.clone(),
        kind: info.kind,
        cpu_total_time: info.cpu_total_time,
        zones: ZoneUsageMap::with_capacity(zones.len()),
        gpu_zones: GpuUsageMap::new(),
        container_id: info.container.as_ref().map(|c| c.id.clone()),
        virtual_machine_id: info.virtual_machine.as_ref().map(|v| v.id.clone()),
    };
    for zone in zones.keys() {
        process.zones.insert(zone.clone(), Usage::default());
    }
    process
}

impl PowerMonitor {
    /// Initializes process power data on the first read: energy shares
    /// come from the initial counter split, no power can be computed.
    pub(crate) fn first_process_read(&mut self, snapshot: &mut Snapshot) {
        let total_cpu_delta = self.resources.node().process_total_cpu_time_delta;
        let running = &self.resources.processes().running;

        let mut processes = HashMap::with_capacity(running.len());
        for info in running.values() {
            let mut process = new_process_record(info, &snapshot.node.zones);
            for (zone_id, node_usage) in &snapshot.node.zones {
                if node_usage.active_energy_interval == Energy::ZERO || total_cpu_delta == 0.0 {
                    continue;
                }
                let cpu_time_ratio = info.cpu_time_delta / total_cpu_delta;
                process.zones.insert(
                    zone_id.clone(),
                    Usage {
                        // no power on the first read, there is no Δt yet
                        power: Power::ZERO,
                        energy_total: node_usage.active_energy_interval.scale(cpu_time_ratio),
                    },
                );
            }
            processes.insert(process.string_id(), process);
        }
        snapshot.processes = processes;

        if self.gpu.is_some() {
            self.calculate_process_gpu_power(None, snapshot);
        }
        log::debug!("initialized process power tracking: {} processes", snapshot.processes.len());
    }

    pub(crate) fn calculate_process_power(&mut self, prev: &Snapshot, snapshot: &mut Snapshot) {
        let procs = self.resources.processes();

        // a terminated process is ingested at most once: a pid cannot
        // terminate twice during the agent's lifetime
        log::debug!("processing terminated processes: {}", procs.terminated.len());
        for pid in &procs.terminated {
            if let Some(prev_process) = prev.processes.get(&pid.to_string()) {
                self.terminated_processes.add(prev_process.clone());
            }
        }

        let total_cpu_delta = self.resources.node().process_total_cpu_time_delta;
        let running = &self.resources.processes().running;
        if running.is_empty() {
            // this is odd!
            log::warn!("no running processes found, skipping process power calculation");
        }

        let mut processes = HashMap::with_capacity(running.len());
        for info in running.values() {
            let mut process = new_process_record(info, &snapshot.node.zones);
            let pid_str = process.string_id();

            for (zone_id, node_usage) in &snapshot.node.zones {
                // the previous total carries over even when the zone was
                // inactive this interval, so energy never decreases
                let prev_energy = prev
                    .processes
                    .get(&pid_str)
                    .and_then(|p| p.zones.get(zone_id))
                    .map(|u| u.energy_total)
                    .unwrap_or(Energy::ZERO);

                let (power, interval_energy) = if node_usage.active_energy_interval == Energy::ZERO
                    || total_cpu_delta == 0.0
                {
                    (Power::ZERO, Energy::ZERO)
                } else {
                    let cpu_time_ratio = info.cpu_time_delta / total_cpu_delta;
                    (
                        node_usage.active_power.scale(cpu_time_ratio),
                        node_usage.active_energy_interval.scale(cpu_time_ratio),
                    )
                };
                process.zones.insert(
                    zone_id.clone(),
                    Usage {
                        power,
                        energy_total: prev_energy + interval_energy,
                    },
                );
            }
            processes.insert(pid_str, process);
        }
        snapshot.processes = processes;

        if self.gpu.is_some() {
            self.calculate_process_gpu_power(Some(prev), snapshot);
        }
    }

    /// Distributes each GPU's active power and interval energy over the
    /// processes reporting SM utilization on it.
    ///
    /// The last share absorbs the integer-division remainder, so the
    /// process powers sum to the node GPU power exactly.
    fn calculate_process_gpu_power(&mut self, prev: Option<&Snapshot>, snapshot: &mut Snapshot) {
        if snapshot.node.gpu_zones.is_empty() {
            return;
        }
        let Some(gpu) = self.gpu.as_ref() else { return };

        for (gpu_id, node_usage) in &snapshot.node.gpu_zones {
            let mut utils: Vec<(i32, f64)> = Vec::new();
            let mut total_sm = 0.0;
            for process in snapshot.processes.values() {
                let Some(util) = gpu.process_utilization(process.pid, *gpu_id) else {
                    continue;
                };
                utils.push((process.pid, util.sm_utilization));
                total_sm += util.sm_utilization;
            }
            utils.sort_by_key(|(pid, _)| *pid);

            if total_sm > 0.0 {
                let mut remaining_power = node_usage.active_power;
                let mut remaining_energy = node_usage.active_energy_interval;
                let last = utils.len() - 1;
                for (i, (pid, sm_utilization)) in utils.iter().enumerate() {
                    let (power, interval_energy) = if i == last {
                        (remaining_power, remaining_energy)
                    } else {
                        let ratio = sm_utilization / total_sm;
                        let power = node_usage.active_power.scale(ratio);
                        let energy = node_usage.active_energy_interval.scale(ratio);
                        remaining_power = remaining_power.saturating_sub(power);
                        remaining_energy = remaining_energy.saturating_sub(energy);
                        (power, energy)
                    };

                    let pid_str = pid.to_string();
                    let prev_energy = prev
                        .and_then(|s| s.processes.get(&pid_str))
                        .and_then(|p| p.gpu_zones.get(gpu_id))
                        .map(|u| u.energy_total)
                        .unwrap_or(Energy::ZERO);
                    if let Some(process) = snapshot.processes.get_mut(&pid_str) {
                        process.gpu_zones.insert(
                            *gpu_id,
                            Usage {
                                power,
                                energy_total: prev_energy + interval_energy,
                            },
                        );
                    }
                }
            }

            // processes that stopped reporting keep their accumulated
            // energy, at zero power
            if let Some(prev) = prev {
                for (pid_str, process) in snapshot.processes.iter_mut() {
                    if process.gpu_zones.contains_key(gpu_id) {
                        continue;
                    }
                    let Some(prev_usage) = prev
                        .processes
                        .get(pid_str)
                        .and_then(|p| p.gpu_zones.get(gpu_id))
                    else {
                        continue;
                    };
                    if prev_usage.energy_total > Energy::ZERO {
                        process.gpu_zones.insert(
                            *gpu_id,
                            Usage {
                                power: Power::ZERO,
                                energy_total: prev_usage.energy_total,
                            },
                        );
                    }
                }
            }

            log::debug!(
                "GPU power attribution: gpu {gpu_id}, node power {}, total SM {total_sm:.1}, {} reporting",
                node_usage.active_power,
                utils.len(),
            );
        }
    }
}
