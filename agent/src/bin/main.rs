use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use tokio_util::sync::CancellationToken;

use wattmon::config::Config;
use wattmon::device::fake::{FakeCpuMeter, FakeGpuMeter};
use wattmon::device::nvml::NvmlMeter;
use wattmon::device::powercap::PowercapMeter;
use wattmon::device::{CpuPowerMeter, GpuPowerMeter};
use wattmon::exporter::prometheus::PrometheusExporter;
use wattmon::exporter::stdout::StdoutExporter;
use wattmon::monitor::PowerMonitor;
use wattmon::resource::kubernetes::PodWatcher;
use wattmon::resource::procfs::ProcfsInformer;
use wattmon::units::{Energy, Power};

const BINARY: &str = env!("CARGO_BIN_NAME");

#[derive(Parser)]
#[command(name = "wattmon-agent", version, about = "Node-local power monitoring agent.")]
struct Cli {
    /// Path to the config file.
    #[arg(long, env = "WATTMON_CONFIG", default_value = "wattmon-config.toml")]
    config: String,

    /// Overrides the collection interval, e.g. `1s` or `500ms`.
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    interval: Option<Duration>,

    /// Overrides the Prometheus listen address, e.g. `0.0.0.0:28282`.
    #[arg(long)]
    listen: Option<String>,

    /// Enables GPU telemetry.
    #[arg(long)]
    gpu: bool,

    /// Enables Kubernetes pod resolution.
    #[arg(long)]
    kube: bool,

    /// Prints the default configuration as TOML and exits.
    #[arg(long)]
    print_default_config: bool,
}

/// About errors: we use `anyhow::Result` and `context` instead of
/// `expect` to get nicer error messages (`expect` prints errors with
/// `Debug`).
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.print_default_config {
        print!("{}", Config::default_toml());
        return Ok(());
    }

    let mut config = Config::load(&cli.config)?;
    if let Some(interval) = cli.interval {
        config.monitor.interval = interval;
    }
    if let Some(listen) = cli.listen.clone() {
        config.exporter.prometheus.listen = listen;
    }
    if cli.gpu {
        config.gpu.enabled = true;
    }
    if cli.kube {
        config.kube.enabled = true;
    }

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log.level.clone())).init();
    log::info!("{BINARY} v{} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let cpu: Box<dyn CpuPowerMeter> = if config.dev.fake_cpu_meter.enabled {
        log::warn!("using the fake CPU meter (dev mode)");
        Box::new(FakeCpuMeter::new(
            &config.dev.fake_cpu_meter.zones,
            Energy::from_joules(config.dev.fake_cpu_meter.energy_step),
        ))
    } else {
        Box::new(PowercapMeter::new(&config.rapl.zones).context("could not open the RAPL powercap sysfs")?)
    };

    let gpu: Option<Box<dyn GpuPowerMeter>> = if config.dev.fake_gpu_meter.enabled {
        log::warn!("using the fake GPU meter (dev mode)");
        Some(Box::new(FakeGpuMeter::new(
            &config.dev.fake_gpu_meter.devices,
            Some(Power::from_watts(config.dev.fake_gpu_meter.power)),
            Energy::from_joules(config.dev.fake_gpu_meter.energy_step),
        )))
    } else if config.gpu.enabled {
        match NvmlMeter::new() {
            Ok(meter) => Some(Box::new(meter)),
            Err(e) => {
                log::warn!("GPU telemetry unavailable, continuing without it: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let pods = if config.kube.enabled {
        let node_name = config
            .kube
            .node_name
            .clone()
            .or_else(|| std::env::var("NODE_NAME").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .context("kube.node_name is not set and neither NODE_NAME nor HOSTNAME is present")?;
        match PodWatcher::in_cluster(node_name, config.kube.pod_refresh_interval) {
            Ok(watcher) => {
                let resolver = watcher.resolver();
                tokio::spawn(watcher.run(shutdown.child_token()));
                Some(resolver)
            }
            Err(e) => {
                log::warn!("Kubernetes pod resolution unavailable: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let informer = Box::new(ProcfsInformer::new(pods));
    let monitor = PowerMonitor::new(cpu, gpu, informer, config.monitor_config());
    let handle = monitor.handle();

    let mut exporter_tasks: Vec<tokio::task::JoinHandle<anyhow::Result<()>>> = Vec::new();
    if config.exporter.prometheus.enabled {
        let exporter = PrometheusExporter::new(
            handle.clone(),
            &config.exporter.prometheus.listen,
            config.monitor.staleness,
            // a stale scrape waits at most one collection interval
            config.monitor.interval,
        )?;
        exporter_tasks.push(tokio::spawn(exporter.serve(shutdown.child_token())));
    }
    if config.exporter.stdout.enabled {
        let exporter = StdoutExporter::new(handle.clone());
        let token = shutdown.child_token();
        exporter_tasks.push(tokio::spawn(async move {
            exporter.run(token).await;
            Ok::<(), anyhow::Error>(())
        }));
    }

    let monitor_task = tokio::spawn(monitor.run(shutdown.child_token()));

    tokio::signal::ctrl_c().await.context("failed to listen for SIGINT")?;
    log::info!("received interrupt, shutting down");
    shutdown.cancel();

    monitor_task.await.context("the collection loop panicked")??;
    for task in exporter_tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("exporter error: {e:#}"),
            Err(e) => log::error!("exporter task panicked: {e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
