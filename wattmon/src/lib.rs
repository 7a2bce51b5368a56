//! Node-local power monitoring.
//!
//! `wattmon` samples CPU energy counters (RAPL) and GPU telemetry
//! (NVML) at a fixed interval and attributes the measured energy to the
//! workloads running on the node: processes, containers, pods and
//! virtual machines. The attribution preserves energy conservation: the
//! per-workload powers of a tier sum to the measured node power.
//!
//! The entry point is [`monitor::PowerMonitor`], constructed from a CPU
//! meter, an optional GPU meter and a resource informer, all behind
//! traits so that fakes can stand in for the hardware. Exporters read
//! the published snapshots through a [`monitor::PowerMonitorHandle`].

pub mod config;
pub mod device;
pub mod exporter;
pub mod monitor;
pub mod resource;
pub mod units;
