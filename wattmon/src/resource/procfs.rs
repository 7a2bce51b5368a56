//! procfs-based resource informer.

use std::collections::{HashMap, HashSet};
use std::fs;

use anyhow::Context;
use procfs::{CurrentSI, KernelStats};
use procfs::process::Process;

use super::cgroup::{vm_from_process, CgroupResolver};
use super::kubernetes::PodResolver;
use super::{
    ContainerRef, NodeCpuInfo, PodRef, ProcessInfo, ProcessKind, ResourceInformer, TrackedProcesses, VmRef,
};

/// Identifies a process across refreshes.
///
/// Pids are reused by the kernel; a process with a known pid but a
/// different fingerprint is a different process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessFingerprint {
    start_time: u64,
    ppid: i32,
}

#[derive(Debug)]
struct WatchedProcess {
    fingerprint: ProcessFingerprint,
    /// Cumulative CPU time at the previous refresh, in seconds.
    cpu_total_time: f64,
    /// Resolved once when the process is first seen.
    container: Option<ContainerRef>,
    virtual_machine: Option<VmRef>,
    comm: String,
    exe: String,
}

/// Enumerates processes from `/proc` and computes CPU-time deltas.
pub struct ProcfsInformer {
    watched: HashMap<i32, WatchedProcess>,
    processes: TrackedProcesses,
    node: NodeCpuInfo,
    prev_kernel_stats: Option<KernelStats>,
    ticks_per_second: u64,
    cgroups: CgroupResolver,
    pods: Option<PodResolver>,
}

impl ProcfsInformer {
    /// `pods` resolves container ids and pod UIDs to Kubernetes names;
    /// without it, pods and containers keep their raw identifiers.
    pub fn new(pods: Option<PodResolver>) -> ProcfsInformer {
        ProcfsInformer {
            watched: HashMap::new(),
            processes: TrackedProcesses::default(),
            node: NodeCpuInfo::default(),
            prev_kernel_stats: None,
            ticks_per_second: procfs::ticks_per_second(),
            cgroups: CgroupResolver::new(),
            pods,
        }
    }

    fn refresh_node_usage(&mut self) -> anyhow::Result<()> {
        let stats = KernelStats::current().context("cannot read /proc/stat")?;

        fn busy_ticks(t: &procfs::CpuTime) -> u64 {
            t.user
                + t.nice
                + t.system
                + t.irq.unwrap_or(0)
                + t.softirq.unwrap_or(0)
                + t.steal.unwrap_or(0)
        }
        fn idle_ticks(t: &procfs::CpuTime) -> u64 {
            t.idle + t.iowait.unwrap_or(0)
        }

        // On the very first refresh the ratio is computed against boot,
        // which is the best available estimate for the first-read split.
        let (busy, idle) = match &self.prev_kernel_stats {
            Some(prev) => (
                busy_ticks(&stats.total).saturating_sub(busy_ticks(&prev.total)),
                idle_ticks(&stats.total).saturating_sub(idle_ticks(&prev.total)),
            ),
            None => (busy_ticks(&stats.total), idle_ticks(&stats.total)),
        };
        let total = busy + idle;
        self.node.cpu_usage_ratio = if total == 0 {
            0.0
        } else {
            (busy as f64 / total as f64).clamp(0.0, 1.0)
        };
        self.prev_kernel_stats = Some(stats);
        Ok(())
    }

    /// Resolves the workload identity of a newly observed process.
    fn resolve_identity(&self, pid: i32, comm: &str, cmdline: &[String]) -> (Option<ContainerRef>, Option<VmRef>) {
        if let Some(vm) = vm_from_process(pid, comm, cmdline) {
            return (None, Some(vm));
        }

        let Ok(content) = fs::read_to_string(format!("/proc/{pid}/cgroup")) else {
            return (None, None);
        };
        for line in content.lines() {
            // hierarchy:controllers:path
            let Some(path) = line.splitn(3, ':').nth(2) else { continue };
            let identity = self.cgroups.parse(path);
            let Some((container_id, runtime)) = identity.container else {
                continue;
            };

            let meta = self.pods.as_ref().and_then(|p| p.lookup_container(&container_id));
            let pod = match (&meta, identity.pod_uid) {
                (Some(meta), _) => Some(PodRef {
                    id: meta.pod_uid.clone(),
                    name: meta.pod_name.clone(),
                    namespace: meta.namespace.clone(),
                }),
                (None, Some(uid)) => {
                    let (name, namespace) = self
                        .pods
                        .as_ref()
                        .and_then(|p| p.lookup_pod(&uid))
                        .unwrap_or_else(|| (uid.clone(), String::new()));
                    Some(PodRef {
                        id: uid,
                        name,
                        namespace,
                    })
                }
                (None, None) => None,
            };
            let name = meta
                .map(|m| m.container_name)
                .unwrap_or_else(|| container_id[..container_id.len().min(12)].to_owned());
            let container = ContainerRef {
                id: container_id,
                name,
                runtime,
                pod,
            };
            return (Some(container), None);
        }
        (None, None)
    }
}

impl ResourceInformer for ProcfsInformer {
    fn refresh(&mut self) -> anyhow::Result<()> {
        self.refresh_node_usage()?;

        let mut running: HashMap<i32, ProcessInfo> = HashMap::new();
        let mut terminated: HashSet<i32> = HashSet::new();
        let mut seen: HashSet<i32> = HashSet::new();
        let mut total_delta = 0.0f64;

        for p in procfs::process::all_processes().context("cannot read /proc")? {
            let process: Process = match p {
                Ok(process) => process,
                // process vanished during enumeration
                Err(_) => continue,
            };
            let pid = process.pid;
            let stat = match process.stat() {
                Ok(stat) => stat,
                Err(_) => continue,
            };
            let fingerprint = ProcessFingerprint {
                start_time: stat.starttime,
                ppid: stat.ppid,
            };
            let cpu_total_time = (stat.utime + stat.stime) as f64 / self.ticks_per_second as f64;

            let known = match self.watched.get(&pid) {
                Some(existing) if existing.fingerprint == fingerprint => true,
                Some(_) => {
                    // pid reused: the previous holder terminated
                    terminated.insert(pid);
                    false
                }
                None => false,
            };

            if !known {
                let comm = stat.comm.clone();
                let exe = process
                    .exe()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let cmdline = process.cmdline().unwrap_or_default();
                let (container, virtual_machine) = self.resolve_identity(pid, &comm, &cmdline);
                self.watched.insert(
                    pid,
                    WatchedProcess {
                        fingerprint,
                        cpu_total_time: 0.0,
                        container,
                        virtual_machine,
                        comm,
                        exe,
                    },
                );
            }

            let watched = self.watched.get_mut(&pid).unwrap();
            let cpu_time_delta = (cpu_total_time - watched.cpu_total_time).max(0.0);
            watched.cpu_total_time = cpu_total_time;
            total_delta += cpu_time_delta;

            let kind = if watched.virtual_machine.is_some() {
                ProcessKind::VirtualMachine
            } else if watched.container.is_some() {
                ProcessKind::Container
            } else {
                ProcessKind::Regular
            };
            running.insert(
                pid,
                ProcessInfo {
                    pid,
                    comm: watched.comm.clone(),
                    exe: watched.exe.clone(),
                    kind,
                    cpu_time_delta,
                    cpu_total_time,
                    container: watched.container.clone(),
                    virtual_machine: watched.virtual_machine.clone(),
                },
            );
            seen.insert(pid);
        }

        // processes that vanished since the previous refresh
        self.watched.retain(|pid, _| {
            if seen.contains(pid) {
                true
            } else {
                terminated.insert(*pid);
                false
            }
        });

        self.node.process_total_cpu_time_delta = total_delta;
        self.processes = TrackedProcesses { running, terminated };
        log::debug!(
            "refreshed processes: {} running, {} terminated, node usage ratio {:.3}",
            self.processes.running.len(),
            self.processes.terminated.len(),
            self.node.cpu_usage_ratio,
        );
        Ok(())
    }

    fn node(&self) -> NodeCpuInfo {
        self.node
    }

    fn processes(&self) -> &TrackedProcesses {
        &self.processes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_reads_live_proc() {
        let own_pid = std::process::id() as i32;
        let mut informer = ProcfsInformer::new(None);

        informer.refresh().expect("refresh against /proc");
        let node = informer.node();
        assert!((0.0..=1.0).contains(&node.cpu_usage_ratio));
        assert!(informer.processes().running.contains_key(&own_pid));

        // a process that keeps running must not be reported terminated
        informer.refresh().expect("second refresh");
        assert!(informer.processes().running.contains_key(&own_pid));
        assert!(!informer.processes().terminated.contains(&own_pid));
    }
}
