//! Snapshot data model.
//!
//! A snapshot is the immutable, timestamped view of node and workload
//! power produced by one collection tick. Workload hierarchy is modeled
//! with ids, not object graphs: each record stores its parent's id and
//! the snapshot's top-level maps act as the arena.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::device::{GpuInfo, ZoneId};
use crate::resource::ProcessKind;
use crate::units::{Energy, Power};

pub type ZoneUsageMap = HashMap<ZoneId, Usage>;
pub type GpuUsageMap = HashMap<u32, Usage>;
pub type NodeZoneUsageMap = HashMap<ZoneId, NodeUsage>;
pub type NodeGpuUsageMap = HashMap<u32, NodeUsage>;

/// Power and cumulative energy of one workload on one zone.
///
/// `energy_total` never decreases over the workload's observed lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub power: Power,
    pub energy_total: Energy,
}

/// Node-level usage of one zone or GPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeUsage {
    /// The last absolute counter reading.
    pub energy_total: Energy,
    /// Cumulative energy attributable to workload activity.
    pub active_energy_total: Energy,
    /// Cumulative remainder of the measured deltas.
    pub idle_energy_total: Energy,

    pub power: Power,
    pub active_power: Power,
    pub idle_power: Power,

    /// Active energy of the current interval, consumed by the
    /// attribution pass. Not exported.
    pub active_energy_interval: Energy,
}

#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Fraction of the node's CPU capacity that was busy, in `[0, 1]`.
    pub cpu_usage_ratio: f64,
    pub zones: NodeZoneUsageMap,
    pub gpu_zones: NodeGpuUsageMap,
    /// Identity of the GPU devices, for labeling.
    pub gpus: HashMap<u32, GpuInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct Process {
    pub pid: i32,
    pub comm: String,
    pub exe: String,
    pub kind: ProcessKind,
    /// Cumulative CPU time, in seconds.
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
    pub gpu_zones: GpuUsageMap,
    pub container_id: Option<String>,
    pub virtual_machine_id: Option<String>,
}

impl Process {
    pub fn string_id(&self) -> String {
        self.pid.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub runtime: String,
    pub pod_id: Option<String>,
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
    pub gpu_zones: GpuUsageMap,
}

#[derive(Debug, Clone, Default)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
    pub gpu_zones: GpuUsageMap,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub hypervisor: String,
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
    pub gpu_zones: GpuUsageMap,
}

/// The published view of one collection tick.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: SystemTime,
    pub node: Node,
    pub processes: HashMap<String, Process>,
    pub containers: HashMap<String, Container>,
    pub pods: HashMap<String, Pod>,
    pub virtual_machines: HashMap<String, VirtualMachine>,
    pub terminated_processes: Vec<Process>,
    pub terminated_containers: Vec<Container>,
    pub terminated_pods: Vec<Pod>,
    pub terminated_virtual_machines: Vec<VirtualMachine>,
}

impl Snapshot {
    pub fn new(timestamp: SystemTime) -> Snapshot {
        Snapshot {
            timestamp,
            node: Node::default(),
            processes: HashMap::new(),
            containers: HashMap::new(),
            pods: HashMap::new(),
            virtual_machines: HashMap::new(),
            terminated_processes: Vec::new(),
            terminated_containers: Vec::new(),
            terminated_pods: Vec::new(),
            terminated_virtual_machines: Vec::new(),
        }
    }

    /// Placeholder published before the first read completes.
    pub fn empty() -> Snapshot {
        Snapshot::new(SystemTime::UNIX_EPOCH)
    }

    pub fn age(&self, now: SystemTime) -> std::time::Duration {
        now.duration_since(self.timestamp).unwrap_or_default()
    }
}

fn usage_maps_energy(zones: &ZoneUsageMap, gpu_zones: &GpuUsageMap) -> Energy {
    zones.values().map(|u| u.energy_total).sum::<Energy>()
        + gpu_zones.values().map(|u| u.energy_total).sum::<Energy>()
}

/// A workload record that can be retained after termination.
pub trait TrackedWorkload: Clone {
    fn workload_id(&self) -> String;

    /// Total cumulative energy across all CPU and GPU zones, used to
    /// rank retention candidates.
    fn total_energy(&self) -> Energy;
}

impl TrackedWorkload for Process {
    fn workload_id(&self) -> String {
        self.string_id()
    }

    fn total_energy(&self) -> Energy {
        usage_maps_energy(&self.zones, &self.gpu_zones)
    }
}

impl TrackedWorkload for Container {
    fn workload_id(&self) -> String {
        self.id.clone()
    }

    fn total_energy(&self) -> Energy {
        usage_maps_energy(&self.zones, &self.gpu_zones)
    }
}

impl TrackedWorkload for Pod {
    fn workload_id(&self) -> String {
        self.id.clone()
    }

    fn total_energy(&self) -> Energy {
        usage_maps_energy(&self.zones, &self.gpu_zones)
    }
}

impl TrackedWorkload for VirtualMachine {
    fn workload_id(&self) -> String {
        self.id.clone()
    }

    fn total_energy(&self) -> Energy {
        usage_maps_energy(&self.zones, &self.gpu_zones)
    }
}
