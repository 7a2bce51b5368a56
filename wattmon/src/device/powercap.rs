// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::fmt::Display;
use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::units::Energy;

use super::{CpuPowerMeter, DeviceError, EnergyZone};

const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";

const PERMISSION_ADVICE: &str = "Try to adjust file permissions.";

/// A RAPL power zone discovered in the powercap sysfs.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// Normalized zone name: `package`, `core`, `uncore`, `dram` or `psys`.
    pub name: String,

    /// The name as returned by powercap, for instance `package-0`.
    pub raw_name: String,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,

    /// The id of the socket that "contains" this zone, if applicable
    /// (psys has no socket).
    pub socket_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }
        let raw = &self.raw_name;
        let path = self.path.to_string_lossy();
        write!(f, "{indent}- {raw} ({}) \t\t: {path}", self.name)?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

fn normalize_zone_name(raw: &str) -> Option<&str> {
    match raw {
        "psys" | "core" | "uncore" | "dram" => Some(raw),
        _ if raw.starts_with("package-") => Some("package"),
        _ => None,
    }
}

/// Discovers all the RAPL power zones in the powercap sysfs.
pub fn all_power_zones() -> anyhow::Result<Vec<PowerZone>> {
    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, parent_socket: Option<u32>, flat: &mut Vec<PowerZone>) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir)? {
            let entry = e?;
            let path = entry.path();
            let file_name = path.file_name().unwrap().to_string_lossy();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let raw_name = fs::read_to_string(&name_path)?.trim().to_owned();
                let socket_id = {
                    if let Some(parent_id) = parent_socket {
                        Some(parent_id)
                    } else if let Some(id_str) = raw_name.strip_prefix("package-") {
                        let id: u32 = id_str
                            .parse()
                            .with_context(|| format!("Failed to extract package id from '{raw_name}'"))?;
                        Some(id)
                    } else {
                        None
                    }
                };
                let name = normalize_zone_name(&raw_name)
                    .with_context(|| format!("Unknown RAPL powercap zone {raw_name}"))?
                    .to_owned();
                let children = explore_rec(&path, socket_id, flat)?; // recursively explore
                let zone = PowerZone {
                    name,
                    raw_name,
                    path,
                    children,
                    socket_id,
                };
                zones.push(zone.clone());
                flat.push(zone);
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    let mut flat = Vec::new();
    explore_rec(Path::new(POWERCAP_RAPL_PATH), None, &mut flat)
        .with_context(|| format!("Could not explore {POWERCAP_RAPL_PATH}. {PERMISSION_ADVICE}"))?;
    Ok(flat)
}

/// A powercap zone opened for repeated reads.
struct OpenedZone {
    file: File,
    name: String,
    index: usize,
    path: PathBuf,
    max_energy: Energy,
    /// Reusable read buffer. The content of `energy_uj` never exceeds
    /// that of `max_energy_range_uj`, 16 bytes in practice.
    buf: Vec<u8>,
}

impl EnergyZone for OpenedZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> usize {
        self.index
    }

    fn path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }

    fn energy(&mut self) -> Result<Energy, DeviceError> {
        self.buf.clear();
        self.file.rewind().map_err(|source| DeviceError::Io {
            path: self.path(),
            source,
        })?;
        self.file.read_to_end(&mut self.buf).map_err(|source| DeviceError::Io {
            path: self.path(),
            source,
        })?;

        let content = std::str::from_utf8(&self.buf).map_err(|_| DeviceError::Parse {
            path: self.path(),
            value: String::from_utf8_lossy(&self.buf).into_owned(),
        })?;
        let uj: u64 = content.trim_end().parse().map_err(|_| DeviceError::Parse {
            path: self.path(),
            value: content.trim_end().to_owned(),
        })?;
        Ok(Energy::from_micro_joules(uj))
    }
}

/// CPU energy meter backed by the RAPL powercap sysfs.
pub struct PowercapMeter {
    zones: Vec<OpenedZone>,
}

impl PowercapMeter {
    /// Opens the powercap zones whose normalized name is in `zone_filter`
    /// (all zones if the filter is empty).
    pub fn new(zone_filter: &[String]) -> anyhow::Result<PowercapMeter> {
        let discovered = all_power_zones()?;
        let selected: Vec<&PowerZone> = discovered
            .iter()
            .filter(|z| zone_filter.is_empty() || zone_filter.iter().any(|f| f == &z.name))
            .collect();
        if selected.is_empty() {
            return Err(anyhow!(
                "No RAPL power zone matches the configured filter {zone_filter:?} (found: {})",
                discovered.iter().map(|z| z.raw_name.clone()).collect::<Vec<_>>().join(", ")
            ));
        }

        let mut opened = Vec::with_capacity(selected.len());
        for zone in selected {
            let file = File::open(zone.energy_path()).with_context(|| {
                format!(
                    "Could not open {}. {PERMISSION_ADVICE}",
                    zone.energy_path().to_string_lossy()
                )
            })?;

            let str_max_energy_uj = fs::read_to_string(zone.max_energy_path()).with_context(|| {
                format!(
                    "Could not read {}. {PERMISSION_ADVICE}",
                    zone.max_energy_path().to_string_lossy()
                )
            })?;
            let max_energy_uj: u64 = str_max_energy_uj
                .trim_end()
                .parse()
                .with_context(|| format!("parse max_energy_uj: '{str_max_energy_uj}'"))?;

            opened.push(OpenedZone {
                file,
                name: zone.name.clone(),
                // psys has no socket, report it on socket 0
                index: zone.socket_id.unwrap_or(0) as usize,
                path: zone.path.clone(),
                max_energy: Energy::from_micro_joules(max_energy_uj),
                buf: Vec::with_capacity(16),
            });
        }

        log::info!(
            "RAPL zones: {}",
            opened
                .iter()
                .map(|z| format!("{}-{}", z.name, z.index))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(PowercapMeter { zones: opened })
    }
}

impl CpuPowerMeter for PowercapMeter {
    fn name(&self) -> &str {
        "rapl-powercap"
    }

    fn zones(&mut self) -> Result<Vec<&mut dyn EnergyZone>, DeviceError> {
        Ok(self.zones.iter_mut().map(|z| z as &mut dyn EnergyZone).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_zone_name;

    #[test]
    fn zone_name_normalization() {
        assert_eq!(normalize_zone_name("package-0"), Some("package"));
        assert_eq!(normalize_zone_name("package-12"), Some("package"));
        assert_eq!(normalize_zone_name("dram"), Some("dram"));
        assert_eq!(normalize_zone_name("psys"), Some("psys"));
        assert_eq!(normalize_zone_name("mmio"), None);
    }
}
