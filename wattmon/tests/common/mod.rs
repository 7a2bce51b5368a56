//! Scripted collaborators for the monitor tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use wattmon::resource::{
    ContainerRef, NodeCpuInfo, ProcessInfo, ProcessKind, ResourceInformer, TrackedProcesses, VmRef,
};

#[derive(Default)]
struct InformerState {
    usage_ratio: f64,
    running: Vec<ProcessInfo>,
    terminated: Vec<i32>,
    fail_refresh: bool,
}

/// Informer whose view is driven explicitly by the test through an
/// [`InformerHandle`].
pub struct ScriptedInformer {
    state: Arc<Mutex<InformerState>>,
    node: NodeCpuInfo,
    processes: TrackedProcesses,
}

#[derive(Clone)]
pub struct InformerHandle {
    state: Arc<Mutex<InformerState>>,
}

pub fn scripted_informer() -> (ScriptedInformer, InformerHandle) {
    let state = Arc::new(Mutex::new(InformerState::default()));
    (
        ScriptedInformer {
            state: state.clone(),
            node: NodeCpuInfo::default(),
            processes: TrackedProcesses::default(),
        },
        InformerHandle { state },
    )
}

impl InformerHandle {
    pub fn set_usage_ratio(&self, ratio: f64) {
        self.state.lock().unwrap().usage_ratio = ratio;
    }

    /// Replaces the running set. Terminations are reported once, on the
    /// next refresh.
    pub fn set_running(&self, processes: Vec<ProcessInfo>) {
        self.state.lock().unwrap().running = processes;
    }

    pub fn terminate(&self, pid: i32) {
        let mut state = self.state.lock().unwrap();
        state.running.retain(|p| p.pid != pid);
        state.terminated.push(pid);
    }

    pub fn fail_next_refresh(&self) {
        self.state.lock().unwrap().fail_refresh = true;
    }
}

impl ResourceInformer for ScriptedInformer {
    fn refresh(&mut self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_refresh {
            state.fail_refresh = false;
            anyhow::bail!("scripted informer failure");
        }

        let running: HashMap<i32, ProcessInfo> =
            state.running.iter().map(|p| (p.pid, p.clone())).collect();
        let terminated: HashSet<i32> = state.terminated.drain(..).collect();
        self.node = NodeCpuInfo {
            cpu_usage_ratio: state.usage_ratio,
            process_total_cpu_time_delta: running.values().map(|p| p.cpu_time_delta).sum(),
        };
        self.processes = TrackedProcesses { running, terminated };
        Ok(())
    }

    fn node(&self) -> NodeCpuInfo {
        self.node
    }

    fn processes(&self) -> &TrackedProcesses {
        &self.processes
    }
}

/// A plain process consuming `cpu_time_delta` seconds this interval.
pub fn process(pid: i32, cpu_time_delta: f64) -> ProcessInfo {
    ProcessInfo {
        pid,
        comm: format!("proc-{pid}"),
        exe: format!("/usr/bin/proc-{pid}"),
        kind: ProcessKind::Regular,
        cpu_time_delta,
        cpu_total_time: cpu_time_delta,
        container: None,
        virtual_machine: None,
    }
}

pub fn containerized(mut info: ProcessInfo, container: ContainerRef) -> ProcessInfo {
    info.kind = ProcessKind::Container;
    info.container = Some(container);
    info
}

pub fn vm_process(mut info: ProcessInfo, vm: VmRef) -> ProcessInfo {
    info.kind = ProcessKind::VirtualMachine;
    info.virtual_machine = Some(vm);
    info
}
