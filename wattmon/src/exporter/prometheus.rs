//! Prometheus metrics endpoint.
//!
//! Serves the current snapshot on `/metrics`. Each scrape takes a fresh
//! snapshot (waiting for the next publication if the current one is
//! stale), rebuilds the gauge families from it and signals the monitor
//! once the encoding succeeded, so terminated workloads are reported in
//! exactly one scrape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use hyper::http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

use crate::monitor::snapshot::{GpuUsageMap, Snapshot, ZoneUsageMap};
use crate::monitor::PowerMonitorHandle;

type Labels = Vec<(String, String)>;
type GaugeFamily = Family<Labels, Gauge<f64, AtomicU64>>;

const METRIC_PREFIX: &str = "wattmon_";

struct MetricState {
    registry: Registry,
    families: HashMap<String, GaugeFamily>,
}

impl MetricState {
    fn new() -> MetricState {
        MetricState {
            registry: Registry::default(),
            families: HashMap::new(),
        }
    }

    /// Registers the family on first use, then reuses it.
    fn family(&mut self, name: &str, help: &str) -> GaugeFamily {
        if let Some(family) = self.families.get(name) {
            return family.clone();
        }
        let family = GaugeFamily::default();
        self.registry
            .register(format!("{METRIC_PREFIX}{name}"), help, family.clone());
        self.families.insert(name.to_owned(), family.clone());
        family
    }

    fn clear(&mut self) {
        for family in self.families.values() {
            family.clear();
        }
    }
}

struct Shared {
    monitor: PowerMonitorHandle,
    staleness: Duration,
    max_wait: Duration,
    state: Mutex<MetricState>,
}

/// HTTP exporter for Prometheus scrapes.
pub struct PrometheusExporter {
    listen: SocketAddr,
    shared: Arc<Shared>,
}

impl PrometheusExporter {
    /// `staleness` is the oldest snapshot age a scrape will serve
    /// without waiting; `max_wait` bounds that wait.
    pub fn new(
        monitor: PowerMonitorHandle,
        listen: &str,
        staleness: Duration,
        max_wait: Duration,
    ) -> anyhow::Result<PrometheusExporter> {
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address {listen:?}"))?;
        Ok(PrometheusExporter {
            listen,
            shared: Arc::new(Shared {
                monitor,
                staleness,
                max_wait,
                state: Mutex::new(MetricState::new()),
            }),
        })
    }

    /// Serves `/metrics` until cancellation.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let shared = self.shared;
        let make_svc = make_service_fn(move |_conn| {
            let shared = shared.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let shared = shared.clone();
                    async move { handle_request(req, shared).await }
                }))
            }
        });

        let server = Server::try_bind(&self.listen)
            .with_context(|| format!("cannot bind {}", self.listen))?
            .serve(make_svc);
        log::info!("Prometheus metrics available on http://{}/metrics", self.listen);

        server
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("metrics server error")
    }
}

async fn handle_request(req: Request<Body>, shared: Arc<Shared>) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap());
    }

    let snapshot = shared.monitor.fresh_snapshot(shared.staleness, shared.max_wait).await;

    let mut buf = String::new();
    let encoded = {
        let mut state = shared.state.lock().unwrap();
        state.clear();
        write_snapshot(&mut state, &snapshot);
        encode(&mut buf, &state.registry)
    };
    if let Err(e) = encoded {
        log::error!("Failed to encode metrics: {e}");
        return Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Internal Server Error"))
            .unwrap());
    }

    // the terminated workloads of this snapshot have now been observed
    shared.monitor.mark_exported();

    Ok(Response::builder()
        .header(
            "Content-Type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buf))
        .unwrap())
}

fn set(family: &GaugeFamily, labels: Labels, value: f64) {
    family.get_or_create(&labels).set(value);
}

/// Populates the gauge families from one snapshot.
fn write_snapshot(state: &mut MetricState, snapshot: &Snapshot) {
    let node = &snapshot.node;

    set(
        &state.family("node_cpu_usage_ratio", "Fraction of the node CPU capacity that was busy."),
        vec![],
        node.cpu_usage_ratio,
    );

    let node_joules = state.family("node_cpu_joules", "Cumulative energy counter of a CPU zone.");
    let node_active = state.family("node_cpu_active_joules", "Cumulative active energy of a CPU zone.");
    let node_idle = state.family("node_cpu_idle_joules", "Cumulative idle energy of a CPU zone.");
    let node_watts = state.family("node_cpu_watts", "Power of a CPU zone over the last interval.");
    let node_active_watts = state.family("node_cpu_active_watts", "Active power of a CPU zone.");
    let node_idle_watts = state.family("node_cpu_idle_watts", "Idle power of a CPU zone.");
    for (zone, usage) in &node.zones {
        let labels = vec![
            ("zone".to_owned(), zone.name.clone()),
            ("index".to_owned(), zone.index.to_string()),
        ];
        set(&node_joules, labels.clone(), usage.energy_total.as_joules());
        set(&node_active, labels.clone(), usage.active_energy_total.as_joules());
        set(&node_idle, labels.clone(), usage.idle_energy_total.as_joules());
        set(&node_watts, labels.clone(), usage.power.as_watts());
        set(&node_active_watts, labels.clone(), usage.active_power.as_watts());
        set(&node_idle_watts, labels, usage.idle_power.as_watts());
    }

    let node_gpu_joules = state.family("node_gpu_joules", "Cumulative energy counter of a GPU.");
    let node_gpu_active = state.family("node_gpu_active_joules", "Cumulative active energy of a GPU.");
    let node_gpu_watts = state.family("node_gpu_watts", "Power of a GPU over the last interval.");
    for (gpu_id, usage) in &node.gpu_zones {
        let mut labels = vec![("gpu".to_owned(), gpu_id.to_string())];
        if let Some(info) = node.gpus.get(gpu_id) {
            labels.push(("uuid".to_owned(), info.uuid.clone()));
            labels.push(("vendor".to_owned(), info.vendor.clone()));
        }
        set(&node_gpu_joules, labels.clone(), usage.energy_total.as_joules());
        set(&node_gpu_active, labels.clone(), usage.active_energy_total.as_joules());
        set(&node_gpu_watts, labels, usage.power.as_watts());
    }

    let process_families = WorkloadFamilies::new(state, "process", "process");
    for process in snapshot.processes.values() {
        let labels = process_labels(process, "running");
        process_families.write(&labels, &process.zones, &process.gpu_zones);
    }
    for process in &snapshot.terminated_processes {
        let labels = process_labels(process, "terminated");
        process_families.write(&labels, &process.zones, &process.gpu_zones);
    }

    let container_families = WorkloadFamilies::new(state, "container", "container");
    for container in snapshot.containers.values() {
        let labels = container_labels(container, "running");
        container_families.write(&labels, &container.zones, &container.gpu_zones);
    }
    for container in &snapshot.terminated_containers {
        let labels = container_labels(container, "terminated");
        container_families.write(&labels, &container.zones, &container.gpu_zones);
    }

    let pod_families = WorkloadFamilies::new(state, "pod", "pod");
    for pod in snapshot.pods.values() {
        let labels = pod_labels(pod, "running");
        pod_families.write(&labels, &pod.zones, &pod.gpu_zones);
    }
    for pod in &snapshot.terminated_pods {
        let labels = pod_labels(pod, "terminated");
        pod_families.write(&labels, &pod.zones, &pod.gpu_zones);
    }

    let vm_families = WorkloadFamilies::new(state, "vm", "virtual machine");
    for vm in snapshot.virtual_machines.values() {
        let labels = vm_labels(vm, "running");
        vm_families.write(&labels, &vm.zones, &vm.gpu_zones);
    }
    for vm in &snapshot.terminated_virtual_machines {
        let labels = vm_labels(vm, "terminated");
        vm_families.write(&labels, &vm.zones, &vm.gpu_zones);
    }
}

/// The four usage families of one workload tier.
struct WorkloadFamilies {
    cpu_joules: GaugeFamily,
    cpu_watts: GaugeFamily,
    gpu_joules: GaugeFamily,
    gpu_watts: GaugeFamily,
}

impl WorkloadFamilies {
    fn new(state: &mut MetricState, tier: &str, display: &str) -> WorkloadFamilies {
        WorkloadFamilies {
            cpu_joules: state.family(
                &format!("{tier}_cpu_joules"),
                &format!("Cumulative CPU energy attributed to a {display}."),
            ),
            cpu_watts: state.family(
                &format!("{tier}_cpu_watts"),
                &format!("CPU power attributed to a {display} over the last interval."),
            ),
            gpu_joules: state.family(
                &format!("{tier}_gpu_joules"),
                &format!("Cumulative GPU energy attributed to a {display}."),
            ),
            gpu_watts: state.family(
                &format!("{tier}_gpu_watts"),
                &format!("GPU power attributed to a {display} over the last interval."),
            ),
        }
    }

    fn write(&self, base_labels: &Labels, zones: &ZoneUsageMap, gpu_zones: &GpuUsageMap) {
        for (zone, usage) in zones {
            let mut labels = base_labels.clone();
            labels.push(("zone".to_owned(), zone.name.clone()));
            labels.push(("index".to_owned(), zone.index.to_string()));
            set(&self.cpu_joules, labels.clone(), usage.energy_total.as_joules());
            set(&self.cpu_watts, labels, usage.power.as_watts());
        }
        for (gpu_id, usage) in gpu_zones {
            let mut labels = base_labels.clone();
            labels.push(("gpu".to_owned(), gpu_id.to_string()));
            set(&self.gpu_joules, labels.clone(), usage.energy_total.as_joules());
            set(&self.gpu_watts, labels, usage.power.as_watts());
        }
    }
}

fn process_labels(process: &crate::monitor::Process, lifecycle: &str) -> Labels {
    vec![
        ("pid".to_owned(), process.string_id()),
        ("comm".to_owned(), process.comm.clone()),
        ("type".to_owned(), process.kind.as_str().to_owned()),
        (
            "container_id".to_owned(),
            process.container_id.clone().unwrap_or_default(),
        ),
        (
            "vm_id".to_owned(),
            process.virtual_machine_id.clone().unwrap_or_default(),
        ),
        ("state".to_owned(), lifecycle.to_owned()),
    ]
}

fn container_labels(container: &crate::monitor::Container, lifecycle: &str) -> Labels {
    vec![
        ("container_id".to_owned(), container.id.clone()),
        ("container_name".to_owned(), container.name.clone()),
        ("runtime".to_owned(), container.runtime.clone()),
        ("pod_id".to_owned(), container.pod_id.clone().unwrap_or_default()),
        ("state".to_owned(), lifecycle.to_owned()),
    ]
}

fn pod_labels(pod: &crate::monitor::Pod, lifecycle: &str) -> Labels {
    vec![
        ("pod_id".to_owned(), pod.id.clone()),
        ("pod_name".to_owned(), pod.name.clone()),
        ("namespace".to_owned(), pod.namespace.clone()),
        ("state".to_owned(), lifecycle.to_owned()),
    ]
}

fn vm_labels(vm: &crate::monitor::VirtualMachine, lifecycle: &str) -> Labels {
    vec![
        ("vm_id".to_owned(), vm.id.clone()),
        ("vm_name".to_owned(), vm.name.clone()),
        ("hypervisor".to_owned(), vm.hypervisor.clone()),
        ("state".to_owned(), lifecycle.to_owned()),
    ]
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::device::ZoneId;
    use crate::monitor::snapshot::{NodeUsage, Process, Usage};
    use crate::units::{Energy, Power};

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new(SystemTime::now());
        snapshot.node.cpu_usage_ratio = 0.5;
        snapshot.node.zones.insert(
            ZoneId::new("package", 0),
            NodeUsage {
                energy_total: Energy::from_joules(12.0),
                active_energy_total: Energy::from_joules(6.0),
                idle_energy_total: Energy::from_joules(6.0),
                power: Power::from_watts(40.0),
                active_power: Power::from_watts(20.0),
                idle_power: Power::from_watts(20.0),
                ..Default::default()
            },
        );
        let mut process = Process {
            pid: 42,
            comm: "worker".to_owned(),
            ..Default::default()
        };
        process.zones.insert(
            ZoneId::new("package", 0),
            Usage {
                power: Power::from_watts(5.0),
                energy_total: Energy::from_joules(3.0),
            },
        );
        snapshot.processes.insert("42".to_owned(), process);
        snapshot
    }

    #[test]
    fn encodes_node_and_process_series() {
        let mut state = MetricState::new();
        write_snapshot(&mut state, &sample_snapshot());

        let mut buf = String::new();
        encode(&mut buf, &state.registry).unwrap();
        assert!(buf.contains("wattmon_node_cpu_usage_ratio 0.5"));
        assert!(buf.contains("wattmon_node_cpu_joules"));
        assert!(buf.contains("zone=\"package\""));
        assert!(buf.contains("wattmon_process_cpu_watts"));
        assert!(buf.contains("comm=\"worker\""));
        assert!(buf.contains("state=\"running\""));
    }

    #[test]
    fn clear_drops_stale_series() {
        let mut state = MetricState::new();
        write_snapshot(&mut state, &sample_snapshot());
        state.clear();

        let mut buf = String::new();
        encode(&mut buf, &state.registry).unwrap();
        assert!(!buf.contains("comm=\"worker\""));
    }
}
