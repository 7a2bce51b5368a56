//! Human-readable snapshot summaries on stdout, for development.

use std::io::Write;

use tokio_util::sync::CancellationToken;

use crate::monitor::snapshot::Snapshot;
use crate::monitor::PowerMonitorHandle;
use crate::units::Power;

pub struct StdoutExporter {
    monitor: PowerMonitorHandle,
    /// How many workloads to print per tier.
    top: usize,
}

impl StdoutExporter {
    pub fn new(monitor: PowerMonitorHandle) -> StdoutExporter {
        StdoutExporter { monitor, top: 10 }
    }

    /// Prints a summary for every published snapshot until cancellation.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut rx = self.monitor.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break; // the monitor is gone
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    if let Err(e) = self.print(&snapshot) {
                        log::warn!("could not write snapshot summary: {e}");
                    }
                }
            }
        }
    }

    fn print(&self, snapshot: &Snapshot) -> std::io::Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();

        writeln!(out, "--- snapshot @ {:?}", snapshot.timestamp)?;
        writeln!(out, "node cpu usage ratio: {:.3}", snapshot.node.cpu_usage_ratio)?;
        let mut zones: Vec<_> = snapshot.node.zones.iter().collect();
        zones.sort_by_key(|(id, _)| (*id).clone());
        for (zone, usage) in zones {
            writeln!(
                out,
                "  zone {zone}: {} ({} active, {} idle), total {}",
                usage.power, usage.active_power, usage.idle_power, usage.energy_total,
            )?;
        }
        for (gpu_id, usage) in &snapshot.node.gpu_zones {
            writeln!(out, "  gpu {gpu_id}: {}, total {}", usage.power, usage.energy_total)?;
        }

        let mut processes: Vec<_> = snapshot.processes.values().collect();
        processes.sort_by_key(|p| std::cmp::Reverse(total_cpu_power(p)));
        writeln!(
            out,
            "processes: {} running, {} terminated (top {} by power)",
            snapshot.processes.len(),
            snapshot.terminated_processes.len(),
            self.top,
        )?;
        for process in processes.iter().take(self.top) {
            writeln!(
                out,
                "  {:>8} {:<16} {}",
                process.pid,
                process.comm,
                total_cpu_power(process),
            )?;
        }
        writeln!(
            out,
            "containers: {}, pods: {}, vms: {}",
            snapshot.containers.len(),
            snapshot.pods.len(),
            snapshot.virtual_machines.len(),
        )?;
        out.flush()
    }
}

fn total_cpu_power(process: &crate::monitor::Process) -> Power {
    process.zones.values().map(|u| u.power).sum()
}
