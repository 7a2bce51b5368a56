//! Enumeration of the workloads running on the node.
//!
//! The monitor consumes the [`ResourceInformer`] trait; the procfs-based
//! implementation lives in [`procfs`]. Container, pod and VM identities
//! are resolved from cgroup paths and (optionally) the Kubernetes API.

use std::collections::{HashMap, HashSet};

pub mod cgroup;
pub mod kubernetes;
pub mod procfs;

/// What kind of workload a process belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessKind {
    #[default]
    Regular,
    Container,
    VirtualMachine,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Regular => "regular",
            ProcessKind::Container => "container",
            ProcessKind::VirtualMachine => "vm",
        }
    }
}

/// Pod identity attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    /// Pod UID.
    pub id: String,
    pub name: String,
    pub namespace: String,
}

/// Container identity attached to a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    /// Container runtime that owns the cgroup: `docker`, `containerd`,
    /// `crio` or `podman`.
    pub runtime: String,
    pub pod: Option<PodRef>,
}

/// Virtual-machine identity attached to a hypervisor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub id: String,
    pub name: String,
    pub hypervisor: String,
}

/// One running process, as seen at the last refresh.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: i32,
    pub comm: String,
    pub exe: String,
    pub kind: ProcessKind,

    /// CPU time consumed during the last refresh interval, in seconds.
    pub cpu_time_delta: f64,
    /// Cumulative CPU time, in seconds.
    pub cpu_total_time: f64,

    pub container: Option<ContainerRef>,
    pub virtual_machine: Option<VmRef>,
}

impl ProcessInfo {
    pub fn string_id(&self) -> String {
        self.pid.to_string()
    }
}

/// Node-level CPU usage for the last refresh interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCpuInfo {
    /// Fraction of the node's CPU capacity that was busy, in `[0, 1]`.
    pub cpu_usage_ratio: f64,
    /// Sum of all processes' `cpu_time_delta`, in seconds.
    pub process_total_cpu_time_delta: f64,
}

/// Running and terminated processes, keyed by pid.
#[derive(Debug, Default)]
pub struct TrackedProcesses {
    pub running: HashMap<i32, ProcessInfo>,
    /// Pids that terminated (or whose pid was reused) since the previous
    /// refresh.
    pub terminated: HashSet<i32>,
}

/// Enumerates the node's processes and their CPU usage.
///
/// `refresh` is called once per collection tick, before any energy
/// reading. A refresh failure aborts the whole tick.
pub trait ResourceInformer: Send {
    fn refresh(&mut self) -> anyhow::Result<()>;

    fn node(&self) -> NodeCpuInfo;

    fn processes(&self) -> &TrackedProcesses;
}
