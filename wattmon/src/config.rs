//! Agent configuration.
//!
//! Loaded from a TOML file; every section has defaults so an empty (or
//! absent) file yields a working CPU-only configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorConfig;
use crate::units::Energy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub log: LogSection,
    pub monitor: MonitorSection,
    pub rapl: RaplSection,
    pub gpu: GpuSection,
    pub kube: KubeSection,
    pub exporter: ExporterSection,
    /// Development settings; do not enable in production.
    pub dev: DevSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSection {
    /// Default log level, overridable with `RUST_LOG`.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorSection {
    /// Interval between two collection ticks.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Age above which a snapshot is considered stale by the exporters.
    #[serde(with = "humantime_serde")]
    pub staleness: Duration,

    /// Terminated workload retention: `> 0` keeps the top-N by energy,
    /// `0` disables tracking, `< 0` retains everything.
    pub max_terminated: i64,

    /// Minimum energy, in joules, for a terminated workload to be
    /// retained.
    pub min_terminated_energy_threshold: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        MonitorSection {
            interval: Duration::from_secs(5),
            staleness: Duration::from_millis(500),
            max_terminated: 500,
            min_terminated_energy_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RaplSection {
    /// Zone names to monitor (`package`, `core`, `uncore`, `dram`,
    /// `psys`). Empty means all available zones.
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GpuSection {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KubeSection {
    pub enabled: bool,

    /// Name of the node this agent runs on, as known to the API server.
    /// Falls back to `NODE_NAME` or the hostname.
    pub node_name: Option<String>,

    /// Interval between two refreshes of the pod metadata map.
    #[serde(with = "humantime_serde")]
    pub pod_refresh_interval: Duration,
}

impl Default for KubeSection {
    fn default() -> Self {
        KubeSection {
            enabled: false,
            node_name: None,
            pod_refresh_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExporterSection {
    pub stdout: StdoutExporterSection,
    pub prometheus: PrometheusExporterSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StdoutExporterSection {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrometheusExporterSection {
    pub enabled: bool,
    /// `host:port` the metrics endpoint listens on.
    pub listen: String,
}

impl Default for PrometheusExporterSection {
    fn default() -> Self {
        PrometheusExporterSection {
            enabled: true,
            listen: "0.0.0.0:28282".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DevSection {
    pub fake_cpu_meter: FakeCpuSection,
    pub fake_gpu_meter: FakeGpuSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FakeCpuSection {
    pub enabled: bool,
    pub zones: Vec<String>,
    /// Energy added to each zone counter on every read, in joules.
    pub energy_step: f64,
}

impl Default for FakeCpuSection {
    fn default() -> Self {
        FakeCpuSection {
            enabled: false,
            zones: vec!["package".to_owned(), "dram".to_owned()],
            energy_step: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FakeGpuSection {
    pub enabled: bool,
    pub devices: Vec<u32>,
    /// Reported instantaneous device power, in watts.
    pub power: f64,
    /// Energy added to each device counter on every read, in joules.
    pub energy_step: f64,
}

impl Default for FakeGpuSection {
    fn default() -> Self {
        FakeGpuSection {
            enabled: false,
            devices: vec![0],
            power: 100.0,
            energy_step: 1000.0,
        }
    }
}

impl Config {
    /// Loads the configuration from `path`. A missing file yields the
    /// default configuration.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("config file {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// The default configuration, rendered as TOML.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).expect("default config must serialize")
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.monitor.interval,
            max_terminated: self.monitor.max_terminated,
            min_terminated_energy_threshold: Energy::from_joules(
                self.monitor.min_terminated_energy_threshold as f64,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips() {
        let rendered = Config::default_toml();
        let parsed: Config = toml::from_str(&rendered).expect("default TOML must parse");
        assert_eq!(parsed.monitor.interval, Duration::from_secs(5));
        assert_eq!(parsed.monitor.max_terminated, 500);
        assert!(parsed.exporter.prometheus.enabled);
        assert!(!parsed.gpu.enabled);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [monitor]
            interval = "1s"
            max_terminated = -1

            [exporter.prometheus]
            listen = "127.0.0.1:9999"
            "#,
        )
        .unwrap();
        assert_eq!(config.monitor.interval, Duration::from_secs(1));
        assert_eq!(config.monitor.max_terminated, -1);
        assert_eq!(config.monitor.staleness, Duration::from_millis(500));
        assert_eq!(config.exporter.prometheus.listen, "127.0.0.1:9999");
        assert!(config.exporter.prometheus.enabled);
    }

    #[test]
    fn monitor_config_converts_threshold_to_energy() {
        let config = Config::default();
        let mc = config.monitor_config();
        assert_eq!(mc.min_terminated_energy_threshold, Energy::from_joules(10.0));
    }
}
