//! Aggregation of process usage into containers, pods and VMs.
//!
//! Aggregates are rebuilt every tick by walking the running processes
//! and summing their usage field-wise. Cumulative energy follows the
//! same law as processes: the aggregate's previous total plus the sum of
//! its members' interval shares, so a member's earlier contribution is
//! not lost when it exits.

use std::collections::HashMap;

use crate::units::Energy;

use super::snapshot::{Container, Pod, Snapshot, Usage, VirtualMachine};
use super::PowerMonitor;

/// Adds a member's power and interval energy into an aggregate map.
fn accumulate<K>(
    dst: &mut HashMap<K, Usage>,
    member_now: &HashMap<K, Usage>,
    member_prev: Option<&HashMap<K, Usage>>,
) where
    K: Clone + Eq + std::hash::Hash,
{
    for (key, usage) in member_now {
        let prev_energy = member_prev
            .and_then(|m| m.get(key))
            .map(|u| u.energy_total)
            .unwrap_or(Energy::ZERO);
        let interval = usage.energy_total.saturating_sub(prev_energy);
        let entry = dst.entry(key.clone()).or_default();
        entry.power += usage.power;
        entry.energy_total += interval;
    }
}

/// Adds the aggregate's previous cumulative totals on top of the summed
/// interval shares.
fn carry_previous<K>(dst: &mut HashMap<K, Usage>, prev: Option<&HashMap<K, Usage>>)
where
    K: Clone + Eq + std::hash::Hash,
{
    let Some(prev) = prev else { return };
    for (key, usage) in prev {
        let entry = dst.entry(key.clone()).or_default();
        entry.energy_total += usage.energy_total;
    }
}

impl PowerMonitor {
    pub(crate) fn aggregate_workloads(&mut self, prev: &Snapshot, snapshot: &mut Snapshot) {
        let mut containers: HashMap<String, Container> = HashMap::new();
        let mut pods: HashMap<String, Pod> = HashMap::new();
        let mut vms: HashMap<String, VirtualMachine> = HashMap::new();

        let running = &self.resources.processes().running;
        for info in running.values() {
            let Some(process) = snapshot.processes.get(&info.pid.to_string()) else {
                continue;
            };
            let prev_process = prev.processes.get(&info.pid.to_string());

            if let Some(cref) = &info.container {
                let container = containers.entry(cref.id.clone()).or_insert_with(|| Container {
                    id: cref.id.clone(),
                    name: cref.name.clone(),
                    runtime: cref.runtime.clone(),
                    pod_id: cref.pod.as_ref().map(|p| p.id.clone()),
                    ..Default::default()
                });
                container.cpu_total_time += process.cpu_total_time;
                accumulate(&mut container.zones, &process.zones, prev_process.map(|p| &p.zones));
                accumulate(
                    &mut container.gpu_zones,
                    &process.gpu_zones,
                    prev_process.map(|p| &p.gpu_zones),
                );

                if let Some(pref) = &cref.pod {
                    let pod = pods.entry(pref.id.clone()).or_insert_with(|| Pod {
                        id: pref.id.clone(),
                        name: pref.name.clone(),
                        namespace: pref.namespace.clone(),
                        ..Default::default()
                    });
                    pod.cpu_total_time += process.cpu_total_time;
                    accumulate(&mut pod.zones, &process.zones, prev_process.map(|p| &p.zones));
                    accumulate(
                        &mut pod.gpu_zones,
                        &process.gpu_zones,
                        prev_process.map(|p| &p.gpu_zones),
                    );
                }
            }

            if let Some(vref) = &info.virtual_machine {
                let vm = vms.entry(vref.id.clone()).or_insert_with(|| VirtualMachine {
                    id: vref.id.clone(),
                    name: vref.name.clone(),
                    hypervisor: vref.hypervisor.clone(),
                    ..Default::default()
                });
                vm.cpu_total_time += process.cpu_total_time;
                accumulate(&mut vm.zones, &process.zones, prev_process.map(|p| &p.zones));
                accumulate(&mut vm.gpu_zones, &process.gpu_zones, prev_process.map(|p| &p.gpu_zones));
            }
        }

        for container in containers.values_mut() {
            let prev_container = prev.containers.get(&container.id);
            carry_previous(&mut container.zones, prev_container.map(|c| &c.zones));
            carry_previous(&mut container.gpu_zones, prev_container.map(|c| &c.gpu_zones));
        }
        for pod in pods.values_mut() {
            let prev_pod = prev.pods.get(&pod.id);
            carry_previous(&mut pod.zones, prev_pod.map(|p| &p.zones));
            carry_previous(&mut pod.gpu_zones, prev_pod.map(|p| &p.gpu_zones));
        }
        for vm in vms.values_mut() {
            let prev_vm = prev.virtual_machines.get(&vm.id);
            carry_previous(&mut vm.zones, prev_vm.map(|v| &v.zones));
            carry_previous(&mut vm.gpu_zones, prev_vm.map(|v| &v.gpu_zones));
        }

        // aggregates that vanished since the previous snapshot move to
        // the terminated trackers
        for (id, container) in &prev.containers {
            if !containers.contains_key(id) {
                self.terminated_containers.add(container.clone());
            }
        }
        for (id, pod) in &prev.pods {
            if !pods.contains_key(id) {
                self.terminated_pods.add(pod.clone());
            }
        }
        for (id, vm) in &prev.virtual_machines {
            if !vms.contains_key(id) {
                self.terminated_vms.add(vm.clone());
            }
        }

        snapshot.containers = containers;
        snapshot.pods = pods;
        snapshot.virtual_machines = vms;
    }
}
