//! End-to-end monitor tests over fake meters and a scripted informer.

mod common;

use std::time::Duration;

use common::{containerized, process, scripted_informer, vm_process, InformerHandle};
use wattmon::device::fake::{FakeCpuHandle, FakeCpuMeter, FakeGpuHandle, FakeGpuMeter};
use wattmon::device::ZoneId;
use wattmon::monitor::{MonitorConfig, PowerMonitor};
use wattmon::resource::{ContainerRef, PodRef, VmRef};
use wattmon::units::{Energy, Power};

const PKG_MAX: u64 = u64::MAX;

fn test_config() -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_secs(5),
        max_terminated: 500,
        min_terminated_energy_threshold: Energy::from_micro_joules(1),
    }
}

/// A monitor over one `package-0` zone and no GPU.
fn cpu_monitor() -> (PowerMonitor, FakeCpuHandle, InformerHandle) {
    let cpu = FakeCpuMeter::with_zones(vec![(
        "package".to_owned(),
        0,
        Energy::from_micro_joules(PKG_MAX),
    )]);
    let cpu_handle = cpu.handle();
    let (informer, informer_handle) = scripted_informer();
    let monitor = PowerMonitor::new(Box::new(cpu), None, Box::new(informer), test_config());
    (monitor, cpu_handle, informer_handle)
}

/// A monitor with one CPU zone and one fake GPU reporting `power`.
fn gpu_monitor(power: Power) -> (PowerMonitor, FakeCpuHandle, FakeGpuHandle, InformerHandle) {
    let cpu = FakeCpuMeter::with_zones(vec![(
        "package".to_owned(),
        0,
        Energy::from_micro_joules(PKG_MAX),
    )]);
    let cpu_handle = cpu.handle();
    let gpu = FakeGpuMeter::new(&[0], Some(power), Energy::ZERO);
    let gpu_handle = gpu.handle();
    let (informer, informer_handle) = scripted_informer();
    let monitor = PowerMonitor::new(Box::new(cpu), Some(Box::new(gpu)), Box::new(informer), test_config());
    (monitor, cpu_handle, gpu_handle, informer_handle)
}

fn pkg() -> ZoneId {
    ZoneId::new("package", 0)
}

#[test]
fn conservation_under_uniform_load() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(1, 50.0), process(2, 50.0)]);

    monitor.collect().unwrap();
    cpu.add_energy("package", 0, Energy::from_micro_joules(1000));
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let node = &snapshot.node.zones[&pkg()];
    assert_eq!(node.active_energy_interval, Energy::from_micro_joules(1000));
    assert_eq!(node.active_energy_total, Energy::from_micro_joules(1000));
    assert_eq!(node.idle_energy_total, Energy::ZERO);
    for pid in ["1", "2"] {
        let usage = snapshot.processes[pid].zones[&pkg()];
        assert_eq!(usage.energy_total, Energy::from_micro_joules(500));
    }
}

#[test]
fn idle_split() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    informer.set_usage_ratio(0.4);
    informer.set_running(vec![process(1, 50.0), process(2, 50.0)]);

    monitor.collect().unwrap();
    cpu.add_energy("package", 0, Energy::from_micro_joules(1000));
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let node = &snapshot.node.zones[&pkg()];
    assert_eq!(node.active_energy_total, Energy::from_micro_joules(400));
    assert_eq!(node.idle_energy_total, Energy::from_micro_joules(600));
    for pid in ["1", "2"] {
        let usage = snapshot.processes[pid].zones[&pkg()];
        assert_eq!(usage.energy_total, Energy::from_micro_joules(200));
    }
}

#[test]
fn gpu_power_split_by_sm_ratio() {
    let node_power = Power::from_micro_watts(150_000_000);
    let (mut monitor, _cpu, gpu, informer) = gpu_monitor(node_power);
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(101, 10.0), process(102, 10.0), process(103, 10.0)]);
    gpu.set_process_utilization(101, 0, 30.0);
    gpu.set_process_utilization(102, 0, 50.0);
    gpu.set_process_utilization(103, 0, 20.0);

    monitor.collect().unwrap();
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    assert_eq!(snapshot.node.gpu_zones[&0].power, node_power);
    assert_eq!(snapshot.node.gpu_zones[&0].active_power, node_power);
    assert_eq!(
        snapshot.processes["101"].gpu_zones[&0].power,
        Power::from_micro_watts(45_000_000)
    );
    assert_eq!(
        snapshot.processes["102"].gpu_zones[&0].power,
        Power::from_micro_watts(75_000_000)
    );
    assert_eq!(
        snapshot.processes["103"].gpu_zones[&0].power,
        Power::from_micro_watts(30_000_000)
    );
}

#[test]
fn gpu_time_sliced_underutilized() {
    // SM utilizations do not have to sum to 100
    let node_power = Power::from_micro_watts(200_000_000);
    let (mut monitor, _cpu, gpu, informer) = gpu_monitor(node_power);
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(11, 10.0), process(12, 10.0)]);
    gpu.set_process_utilization(11, 0, 10.0);
    gpu.set_process_utilization(12, 0, 15.0);

    monitor.collect().unwrap();
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    assert_eq!(
        snapshot.processes["11"].gpu_zones[&0].power,
        Power::from_micro_watts(80_000_000)
    );
    assert_eq!(
        snapshot.processes["12"].gpu_zones[&0].power,
        Power::from_micro_watts(120_000_000)
    );
}

#[test]
fn gpu_power_sums_exactly_for_awkward_ratios() {
    let node_power = Power::from_micro_watts(123_456_789);
    let (mut monitor, _cpu, gpu, informer) = gpu_monitor(node_power);
    informer.set_usage_ratio(1.0);
    let pids = [21, 22, 23, 24];
    informer.set_running(pids.iter().map(|&pid| process(pid, 1.0)).collect());
    for (pid, sm) in pids.iter().zip([33.3, 33.4, 0.1, 12.7]) {
        gpu.set_process_utilization(*pid, 0, sm);
    }

    monitor.collect().unwrap();
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let sum: Power = pids
        .iter()
        .map(|pid| snapshot.processes[&pid.to_string()].gpu_zones[&0].power)
        .sum();
    assert_eq!(sum, snapshot.node.gpu_zones[&0].power);
}

#[test]
fn gpu_idle_when_nothing_reports() {
    let (mut monitor, _cpu, _gpu, informer) = gpu_monitor(Power::from_watts(100.0));
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(1, 10.0)]);

    monitor.collect().unwrap();
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    // no SM utilization: the node keeps its power, processes get none
    assert_eq!(snapshot.node.gpu_zones[&0].power, Power::from_watts(100.0));
    assert!(snapshot.processes["1"].gpu_zones.is_empty());
}

#[test]
fn counter_wrap_produces_positive_delta() {
    let max = (1u64 << 32) - 1;
    let cpu = FakeCpuMeter::with_zones(vec![("package".to_owned(), 0, Energy::from_micro_joules(max))]);
    let cpu_handle = cpu.handle();
    let (informer, informer_handle) = scripted_informer();
    informer_handle.set_usage_ratio(1.0);
    informer_handle.set_running(vec![process(1, 100.0)]);
    let mut monitor = PowerMonitor::new(Box::new(cpu), None, Box::new(informer), test_config());

    cpu_handle.set_energy("package", 0, Energy::from_micro_joules(max - 9));
    monitor.collect().unwrap();
    let before = monitor.handle().current();
    let energy_before = before.processes["1"].zones[&pkg()].energy_total;

    cpu_handle.set_energy("package", 0, Energy::from_micro_joules(40));
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let node = &snapshot.node.zones[&pkg()];
    assert_eq!(node.energy_total, Energy::from_micro_joules(40));
    assert_eq!(node.active_energy_interval, Energy::from_micro_joules(49));
    assert_eq!(
        snapshot.processes["1"].zones[&pkg()].energy_total,
        energy_before + Energy::from_micro_joules(49)
    );
}

#[test]
fn terminated_process_retained_until_export() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    let handle = monitor.handle();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(7, 100.0)]);

    monitor.collect().unwrap();
    cpu.add_energy("package", 0, Energy::from_micro_joules(1000));
    monitor.collect().unwrap();

    informer.terminate(7);
    monitor.collect().unwrap();

    let snapshot = handle.current();
    assert!(!snapshot.processes.contains_key("7"));
    assert_eq!(snapshot.terminated_processes.len(), 1);
    let retained = &snapshot.terminated_processes[0];
    assert_eq!(retained.pid, 7);
    // the clone carries the last observed values
    assert_eq!(retained.zones[&pkg()].energy_total, Energy::from_micro_joules(1000));

    // one exporter-visible snapshot, then gone
    handle.mark_exported();
    monitor.collect().unwrap();
    assert!(handle.current().terminated_processes.is_empty());
}

#[test]
fn terminated_tracking_disabled() {
    let cpu = FakeCpuMeter::with_zones(vec![(
        "package".to_owned(),
        0,
        Energy::from_micro_joules(PKG_MAX),
    )]);
    let cpu_handle = cpu.handle();
    let (informer, informer_handle) = scripted_informer();
    informer_handle.set_usage_ratio(1.0);
    informer_handle.set_running(vec![process(7, 100.0)]);
    let mut monitor = PowerMonitor::new(
        Box::new(cpu),
        None,
        Box::new(informer),
        MonitorConfig {
            max_terminated: 0,
            ..test_config()
        },
    );

    monitor.collect().unwrap();
    cpu_handle.add_energy("package", 0, Energy::from_micro_joules(1000));
    monitor.collect().unwrap();
    informer_handle.terminate(7);
    monitor.collect().unwrap();

    assert!(monitor.handle().current().terminated_processes.is_empty());
}

#[test]
fn cpu_conservation_within_rounding() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    informer.set_usage_ratio(0.73);
    let deltas = [13.0, 7.0, 29.0, 1.0, 50.0];
    informer.set_running(
        deltas
            .iter()
            .enumerate()
            .map(|(i, &d)| process(i as i32 + 1, d))
            .collect(),
    );

    monitor.collect().unwrap();
    cpu.add_energy("package", 0, Energy::from_micro_joules(999_983));
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let active = snapshot.node.zones[&pkg()].active_energy_interval;
    let attributed: Energy = snapshot
        .processes
        .values()
        .map(|p| p.zones[&pkg()].energy_total)
        .sum();
    // shares truncate down, so the sum may fall short by at most one
    // microjoule per process
    assert!(attributed <= active);
    assert!(
        active.as_micro_joules() - attributed.as_micro_joules() < deltas.len() as u64,
        "attributed {attributed} vs active {active}"
    );
}

#[test]
fn energy_total_never_decreases() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    informer.set_usage_ratio(0.9);
    informer.set_running(vec![process(1, 30.0), process(2, 70.0)]);

    monitor.collect().unwrap();
    let mut previous = [Energy::ZERO, Energy::ZERO];
    // the second interval has a zero counter delta on purpose
    for delta in [5000u64, 0, 12345] {
        cpu.add_energy("package", 0, Energy::from_micro_joules(delta));
        monitor.collect().unwrap();
        let snapshot = monitor.handle().current();
        for (i, pid) in ["1", "2"].iter().enumerate() {
            let energy = snapshot.processes[*pid].zones[&pkg()].energy_total;
            assert!(energy >= previous[i], "energy of pid {pid} decreased");
            previous[i] = energy;
        }
    }
}

#[test]
fn hierarchy_sums_match_members() {
    let pod = PodRef {
        id: "pod-x".to_owned(),
        name: "web".to_owned(),
        namespace: "default".to_owned(),
    };
    let container_a = ContainerRef {
        id: "aaaa".to_owned(),
        name: "app".to_owned(),
        runtime: "containerd".to_owned(),
        pod: Some(pod.clone()),
    };
    let container_b = ContainerRef {
        id: "bbbb".to_owned(),
        name: "sidecar".to_owned(),
        runtime: "containerd".to_owned(),
        pod: Some(pod),
    };
    let vm = VmRef {
        id: "vm-1".to_owned(),
        name: "guest".to_owned(),
        hypervisor: "kvm".to_owned(),
    };

    let (mut monitor, cpu, informer) = cpu_monitor();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![
        containerized(process(1, 10.0), container_a.clone()),
        containerized(process(2, 30.0), container_a),
        containerized(process(3, 20.0), container_b),
        vm_process(process(4, 40.0), vm),
    ]);

    monitor.collect().unwrap();
    cpu.add_energy("package", 0, Energy::from_micro_joules(100_000));
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let proc_energy =
        |pid: &str| snapshot.processes[pid].zones[&pkg()].energy_total;
    let proc_power = |pid: &str| snapshot.processes[pid].zones[&pkg()].power;

    let container = &snapshot.containers["aaaa"];
    assert_eq!(container.zones[&pkg()].energy_total, proc_energy("1") + proc_energy("2"));
    assert_eq!(container.zones[&pkg()].power, proc_power("1") + proc_power("2"));
    assert_eq!(container.pod_id.as_deref(), Some("pod-x"));

    let pod = &snapshot.pods["pod-x"];
    let container_sum = snapshot.containers["aaaa"].zones[&pkg()].energy_total
        + snapshot.containers["bbbb"].zones[&pkg()].energy_total;
    assert_eq!(pod.zones[&pkg()].energy_total, container_sum);
    assert_eq!(pod.namespace, "default");

    let vm = &snapshot.virtual_machines["vm-1"];
    assert_eq!(vm.zones[&pkg()].energy_total, proc_energy("4"));
}

#[test]
fn terminated_container_and_pod_retained() {
    let pod = PodRef {
        id: "pod-y".to_owned(),
        name: "job".to_owned(),
        namespace: "batch".to_owned(),
    };
    let container = ContainerRef {
        id: "cccc".to_owned(),
        name: "task".to_owned(),
        runtime: "containerd".to_owned(),
        pod: Some(pod),
    };

    let (mut monitor, cpu, informer) = cpu_monitor();
    let handle = monitor.handle();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![containerized(process(9, 100.0), container)]);

    monitor.collect().unwrap();
    cpu.add_energy("package", 0, Energy::from_micro_joules(4000));
    monitor.collect().unwrap();

    informer.terminate(9);
    monitor.collect().unwrap();

    let snapshot = handle.current();
    assert!(snapshot.containers.is_empty());
    assert_eq!(snapshot.terminated_containers.len(), 1);
    assert_eq!(snapshot.terminated_containers[0].id, "cccc");
    assert_eq!(snapshot.terminated_pods.len(), 1);
    assert_eq!(snapshot.terminated_pods[0].id, "pod-y");

    handle.mark_exported();
    monitor.collect().unwrap();
    let snapshot = handle.current();
    assert!(snapshot.terminated_containers.is_empty());
    assert!(snapshot.terminated_pods.is_empty());
}

#[test]
fn first_read_has_zero_power_and_plausible_energy() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    informer.set_usage_ratio(0.5);
    informer.set_running(vec![process(1, 100.0)]);
    cpu.set_energy("package", 0, Energy::from_micro_joules(10_000));

    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let node = &snapshot.node.zones[&pkg()];
    assert_eq!(node.energy_total, Energy::from_micro_joules(10_000));
    assert_eq!(node.active_energy_total, Energy::from_micro_joules(5_000));
    assert_eq!(node.idle_energy_total, Energy::from_micro_joules(5_000));
    assert_eq!(node.power, Power::ZERO);
    let usage = snapshot.processes["1"].zones[&pkg()];
    assert_eq!(usage.power, Power::ZERO);
    assert_eq!(usage.energy_total, Energy::from_micro_joules(5_000));
}

#[test]
fn failing_zone_is_skipped_but_snapshot_advances() {
    let cpu = FakeCpuMeter::with_zones(vec![
        ("package".to_owned(), 0, Energy::from_micro_joules(PKG_MAX)),
        ("dram".to_owned(), 0, Energy::from_micro_joules(PKG_MAX)),
    ]);
    let cpu_handle = cpu.handle();
    let (informer, informer_handle) = scripted_informer();
    informer_handle.set_usage_ratio(1.0);
    informer_handle.set_running(vec![process(1, 10.0)]);
    let mut monitor = PowerMonitor::new(Box::new(cpu), None, Box::new(informer), test_config());

    monitor.collect().unwrap();
    cpu_handle.add_energy("package", 0, Energy::from_micro_joules(500));
    cpu_handle.set_failing("dram", 0, true);
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    assert!(snapshot.node.zones.contains_key(&pkg()));
    assert!(!snapshot.node.zones.contains_key(&ZoneId::new("dram", 0)));
    assert_eq!(
        snapshot.node.zones[&pkg()].active_energy_interval,
        Energy::from_micro_joules(500)
    );
}

#[test]
fn informer_failure_keeps_previous_snapshot() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    let handle = monitor.handle();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(1, 10.0)]);

    monitor.collect().unwrap();
    let before = handle.current();

    cpu.add_energy("package", 0, Energy::from_micro_joules(500));
    informer.fail_next_refresh();
    assert!(monitor.collect().is_err());

    let after = handle.current();
    assert_eq!(before.timestamp, after.timestamp);
}

#[tokio::test]
async fn publish_emits_notification_token() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    let handle = monitor.handle();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(1, 10.0)]);
    monitor.collect().unwrap();

    let mut rx = handle.subscribe();
    rx.borrow_and_update();
    cpu.add_energy("package", 0, Energy::from_micro_joules(100));
    monitor.collect().unwrap();

    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("no notification after publish")
        .expect("publisher dropped");
}

#[test]
fn gpu_energy_is_conserved_across_ticks() {
    // no instantaneous power: energy comes from the wrapping counter
    let cpu = FakeCpuMeter::with_zones(vec![(
        "package".to_owned(),
        0,
        Energy::from_micro_joules(PKG_MAX),
    )]);
    let gpu = FakeGpuMeter::new(&[0], None, Energy::from_joules(1000.0));
    let gpu_handle = gpu.handle();
    let (informer, informer_handle) = scripted_informer();
    informer_handle.set_usage_ratio(1.0);
    informer_handle.set_running(vec![process(31, 10.0), process(32, 10.0)]);
    gpu_handle.set_process_utilization(31, 0, 60.0);
    gpu_handle.set_process_utilization(32, 0, 40.0);
    let mut monitor = PowerMonitor::new(Box::new(cpu), Some(Box::new(gpu)), Box::new(informer), test_config());

    monitor.collect().unwrap();
    monitor.collect().unwrap();
    monitor.collect().unwrap();

    let snapshot = monitor.handle().current();
    let node = &snapshot.node.gpu_zones[&0];
    let attributed: Energy = ["31", "32"]
        .iter()
        .map(|pid| snapshot.processes[*pid].gpu_zones[&0].energy_total)
        .sum();
    // the whole GPU delta is active and fully attributed, exactly
    assert_eq!(attributed, node.active_energy_total);
    assert!(node.active_energy_total >= Energy::from_joules(3000.0));
}

#[tokio::test]
async fn run_loop_publishes_and_stops_on_cancel() {
    use tokio_util::sync::CancellationToken;

    let cpu = FakeCpuMeter::new(&["package".to_owned()], Energy::from_joules(1.0));
    let (informer, informer_handle) = scripted_informer();
    informer_handle.set_usage_ratio(1.0);
    informer_handle.set_running(vec![process(1, 10.0)]);
    let monitor = PowerMonitor::new(
        Box::new(cpu),
        None,
        Box::new(informer),
        MonitorConfig {
            interval: Duration::from_millis(10),
            ..test_config()
        },
    );
    let handle = monitor.handle();
    let token = CancellationToken::new();
    let task = tokio::spawn(monitor.run(token.clone()));

    let mut rx = handle.subscribe();
    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("no snapshot published")
            .expect("publisher dropped");
    }

    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("loop did not stop")
        .expect("loop panicked")
        .expect("loop failed");

    // the last snapshot stays readable after the stop
    let last = handle.current();
    assert!(last.processes.contains_key("1"));
}

#[tokio::test]
async fn fresh_snapshot_waits_for_next_publish() {
    let (mut monitor, cpu, informer) = cpu_monitor();
    let handle = monitor.handle();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(1, 10.0)]);
    monitor.collect().unwrap();
    let first = handle.current().timestamp;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let waiter = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .fresh_snapshot(Duration::from_millis(10), Duration::from_secs(2))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cpu.add_energy("package", 0, Energy::from_micro_joules(100));
    monitor.collect().unwrap();

    let snapshot = waiter.await.unwrap();
    assert!(snapshot.timestamp > first);
}

#[tokio::test]
async fn fresh_snapshot_serves_current_when_fresh() {
    let (mut monitor, _cpu, informer) = cpu_monitor();
    let handle = monitor.handle();
    informer.set_usage_ratio(1.0);
    informer.set_running(vec![process(1, 10.0)]);
    monitor.collect().unwrap();

    let snapshot = handle
        .fresh_snapshot(Duration::from_secs(60), Duration::from_millis(10))
        .await;
    assert_eq!(snapshot.timestamp, handle.current().timestamp);
}
