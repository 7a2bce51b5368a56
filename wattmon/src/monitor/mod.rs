//! The power monitor.
//!
//! One writer task owns the collection loop: every tick it refreshes the
//! resource informer, reads the CPU and GPU energy sources, attributes
//! the measured energy to workloads and publishes a fresh immutable
//! [`Snapshot`]. Readers take snapshot handles through a
//! [`PowerMonitorHandle`] without ever blocking the writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::device::{CpuPowerMeter, GpuPowerMeter};
use crate::resource::ResourceInformer;
use crate::units::Energy;

mod aggregate;
mod node;
mod process;
pub mod snapshot;
pub mod terminated;

pub use snapshot::{
    Container, Node, NodeUsage, Pod, Process, Snapshot, TrackedWorkload, Usage, VirtualMachine,
};
use terminated::TerminatedTracker;

/// Tuning of the collection loop and the terminated-workload retention.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between two collection ticks.
    pub interval: Duration,

    /// Terminated-workload retention: `> 0` keeps the top-N by energy,
    /// `0` disables tracking, `< 0` retains everything.
    pub max_terminated: i64,

    /// Terminated workloads below this energy are never retained.
    pub min_terminated_energy_threshold: Energy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval: Duration::from_secs(5),
            max_terminated: 500,
            min_terminated_energy_threshold: Energy::ZERO,
        }
    }
}

/// Read-side handle on the monitor.
///
/// Cheap to clone; every clone observes the same totally-ordered
/// sequence of snapshots.
#[derive(Clone)]
pub struct PowerMonitorHandle {
    rx: watch::Receiver<Arc<Snapshot>>,
    exported: Arc<AtomicBool>,
}

impl PowerMonitorHandle {
    /// The latest published snapshot. Non-blocking; the returned value
    /// is never mutated.
    pub fn current(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// A receiver that resolves whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.rx.clone()
    }

    /// Returns a snapshot no older than `max_age`, waiting up to
    /// `max_wait` for the next publication if the current one is stale.
    pub async fn fresh_snapshot(&self, max_age: Duration, max_wait: Duration) -> Arc<Snapshot> {
        let current = self.current();
        if current.age(SystemTime::now()) <= max_age {
            return current;
        }
        let mut rx = self.rx.clone();
        rx.borrow_and_update();
        // on timeout, serve what we have rather than fail the reader
        let _ = tokio::time::timeout(max_wait, rx.changed()).await;
        self.current()
    }

    /// Signals that the current snapshot has been encoded and flushed by
    /// an exporter. Idempotent. The next collection tick clears the
    /// terminated-workload trackers.
    pub fn mark_exported(&self) {
        self.exported.store(true, Ordering::Release);
    }
}

/// Owns the collection loop and all mutable monitoring state.
pub struct PowerMonitor {
    cpu: Box<dyn CpuPowerMeter>,
    gpu: Option<Box<dyn GpuPowerMeter>>,
    resources: Box<dyn ResourceInformer>,
    interval: Duration,

    initialized: bool,
    terminated_processes: TerminatedTracker<Process>,
    terminated_containers: TerminatedTracker<Container>,
    terminated_pods: TerminatedTracker<Pod>,
    terminated_vms: TerminatedTracker<VirtualMachine>,

    exported: Arc<AtomicBool>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
}

impl PowerMonitor {
    pub fn new(
        cpu: Box<dyn CpuPowerMeter>,
        gpu: Option<Box<dyn GpuPowerMeter>>,
        resources: Box<dyn ResourceInformer>,
        config: MonitorConfig,
    ) -> PowerMonitor {
        let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot::empty()));
        PowerMonitor {
            cpu,
            gpu,
            resources,
            interval: config.interval,
            initialized: false,
            terminated_processes: TerminatedTracker::new(
                config.max_terminated,
                config.min_terminated_energy_threshold,
            ),
            terminated_containers: TerminatedTracker::new(
                config.max_terminated,
                config.min_terminated_energy_threshold,
            ),
            terminated_pods: TerminatedTracker::new(
                config.max_terminated,
                config.min_terminated_energy_threshold,
            ),
            terminated_vms: TerminatedTracker::new(
                config.max_terminated,
                config.min_terminated_energy_threshold,
            ),
            exported: Arc::new(AtomicBool::new(false)),
            snapshot_tx,
        }
    }

    pub fn handle(&self) -> PowerMonitorHandle {
        PowerMonitorHandle {
            rx: self.snapshot_tx.subscribe(),
            exported: self.exported.clone(),
        }
    }

    /// Runs the collection loop until `shutdown` is cancelled.
    ///
    /// The first tick runs immediately; after cancellation the
    /// last-published snapshot stays readable through the handles.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        if let Some(gpu) = self.gpu.as_mut() {
            if let Err(e) = gpu.start() {
                log::warn!("GPU telemetry could not start, continuing without GPU data: {e:#}");
                self.gpu = None;
            }
        }

        if let Err(e) = self.collect() {
            log::error!("first collection failed (will retry): {e:#}");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick of an interval completes immediately

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.collect() {
                        // the previously published snapshot stays current
                        log::error!("collection tick failed: {e:#}");
                    }
                }
            }
        }

        if let Some(gpu) = self.gpu.as_mut() {
            if let Err(e) = gpu.stop() {
                log::warn!("failed to stop GPU telemetry: {e:#}");
            }
        }
        log::info!("power monitor stopped");
        Ok(())
    }

    /// Performs one collection tick and publishes the resulting snapshot.
    ///
    /// Exposed to integration tests; production code drives it through
    /// [`run`](Self::run).
    pub fn collect(&mut self) -> anyhow::Result<()> {
        self.resources
            .refresh()
            .context("resource informer refresh failed")?;

        if self.exported.swap(false, Ordering::AcqRel) {
            log::debug!("clearing terminated workloads after export");
            self.terminated_processes.clear();
            self.terminated_containers.clear();
            self.terminated_pods.clear();
            self.terminated_vms.clear();
        }

        let now = SystemTime::now();
        let prev = self.snapshot_tx.borrow().clone();
        let mut snapshot = Snapshot::new(now);

        if !self.initialized {
            self.first_node_read(&mut snapshot)?;
            self.first_process_read(&mut snapshot);
        } else {
            self.calculate_node_power(&prev, &mut snapshot)?;
            self.calculate_process_power(&prev, &mut snapshot);
        }
        self.aggregate_workloads(&prev, &mut snapshot);

        snapshot.terminated_processes = self.terminated_processes.items();
        snapshot.terminated_containers = self.terminated_containers.items();
        snapshot.terminated_pods = self.terminated_pods.items();
        snapshot.terminated_virtual_machines = self.terminated_vms.items();

        log::debug!(
            "publishing snapshot: {} processes, {} containers, {} pods, {} vms, {} terminated processes",
            snapshot.processes.len(),
            snapshot.containers.len(),
            snapshot.pods.len(),
            snapshot.virtual_machines.len(),
            snapshot.terminated_processes.len(),
        );
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        self.initialized = true;
        Ok(())
    }
}
