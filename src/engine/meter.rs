//! CPU utilization and temperature sources.

use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use sysinfo::{Components, CpuRefreshKind, RefreshKind, System};
use tracing::debug;

use super::sample::TemperatureReading;
use super::EngineError;

/// Interval-based per-core utilization.
///
/// The sampler calls [`begin`](Self::begin), waits out the window, then
/// calls [`read`](Self::read); the reading covers exactly that window.
pub trait UtilizationSource: Send {
    fn is_supported(&self) -> bool {
        true
    }

    /// Shortest window that yields a meaningful reading.
    fn min_window(&self) -> Duration {
        Duration::ZERO
    }

    fn begin(&mut self) -> Result<(), EngineError>;

    /// Percent busy per logical core since the last `begin`.
    fn read(&mut self) -> Result<Vec<f32>, EngineError>;
}

pub struct SysinfoMeter {
    sys: System,
}

impl SysinfoMeter {
    pub fn new() -> Self {
        Self {
            sys: System::new_with_specifics(
                RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
            ),
        }
    }
}

impl Default for SysinfoMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl UtilizationSource for SysinfoMeter {
    fn is_supported(&self) -> bool {
        sysinfo::IS_SUPPORTED_SYSTEM
    }

    fn min_window(&self) -> Duration {
        sysinfo::MINIMUM_CPU_UPDATE_INTERVAL
    }

    fn begin(&mut self) -> Result<(), EngineError> {
        self.sys.refresh_cpu_usage();
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<f32>, EngineError> {
        self.sys.refresh_cpu_usage();
        let usage: Vec<f32> = self
            .sys
            .cpus()
            .iter()
            .map(|cpu| cpu.cpu_usage().clamp(0.0, 100.0))
            .collect();
        if usage.is_empty() {
            return Err(EngineError::MeasurementUnavailable(
                "no CPUs reported by the OS".into(),
            ));
        }
        Ok(usage)
    }
}

/// Logical CPU count, never zero.
pub fn logical_core_count() -> usize {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    match sys.cpus().len() {
        0 => std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1),
        n => n,
    }
}

/// Best-effort temperature sensors. An empty list means "no sensors", which
/// is not an error.
pub trait ThermalSource: Send + Sync {
    fn read(&self) -> Vec<TemperatureReading>;
}

/// sysinfo components, falling back to the kernel thermal zones (the only
/// source on many ARM boards).
pub struct SystemThermal;

impl ThermalSource for SystemThermal {
    fn read(&self) -> Vec<TemperatureReading> {
        let components = Components::new_with_refreshed_list();
        let readings: Vec<TemperatureReading> = components
            .list()
            .iter()
            .filter(|c| plausible(c.temperature()))
            .map(|c| TemperatureReading {
                label: c.label().to_string(),
                celsius: c.temperature(),
            })
            .collect();

        if !readings.is_empty() {
            return readings;
        }

        let zones = read_thermal_zones(Path::new("/sys/class/thermal"));
        if zones.is_empty() {
            debug!("no temperature sensors available");
        }
        zones
    }
}

fn plausible(celsius: f32) -> bool {
    celsius.is_finite() && (-40.0..=150.0).contains(&celsius)
}

/// Read every `thermal_zone*/temp` (millidegrees) under `root`.
fn read_thermal_zones(root: &Path) -> Vec<TemperatureReading> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut readings: Vec<TemperatureReading> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
        .filter_map(|e| {
            let zone = e.path();
            let milli: f32 = fs::read_to_string(zone.join("temp")).ok()?.trim().parse().ok()?;
            let celsius = milli / 1000.0;
            if !plausible(celsius) {
                return None;
            }
            let label = fs::read_to_string(zone.join("type"))
                .map(|t| t.trim().to_string())
                .unwrap_or_else(|_| e.file_name().to_string_lossy().into_owned());
            Some(TemperatureReading { label, celsius })
        })
        .collect();

    readings.sort_by(|a, b| a.label.cmp(&b.label));
    readings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_core_count_nonzero() {
        assert!(logical_core_count() >= 1);
    }

    #[test]
    fn test_thermal_zones_from_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let zone0 = dir.path().join("thermal_zone0");
        fs::create_dir(&zone0).unwrap();
        fs::write(zone0.join("temp"), "52150\n").unwrap();
        fs::write(zone0.join("type"), "cpu-thermal\n").unwrap();

        let zone1 = dir.path().join("thermal_zone1");
        fs::create_dir(&zone1).unwrap();
        fs::write(zone1.join("temp"), "garbage").unwrap();

        fs::create_dir(dir.path().join("cooling_device0")).unwrap();

        let readings = read_thermal_zones(dir.path());
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].label, "cpu-thermal");
        assert!((readings[0].celsius - 52.15).abs() < 0.001);
    }

    #[test]
    fn test_missing_thermal_root() {
        assert!(read_thermal_zones(Path::new("/nonexistent/thermal")).is_empty());
    }

    #[test]
    fn test_plausible_range() {
        assert!(plausible(45.0));
        assert!(!plausible(f32::NAN));
        assert!(!plausible(-273.0));
    }

    #[test]
    fn test_sysinfo_meter_reads_bounded_values() {
        let mut meter = SysinfoMeter::new();
        if !meter.is_supported() {
            return;
        }
        meter.begin().unwrap();
        std::thread::sleep(meter.min_window());
        let usage = meter.read().unwrap();
        assert!(!usage.is_empty());
        assert!(usage.iter().all(|u| (0.0..=100.0).contains(u)));
    }
}
