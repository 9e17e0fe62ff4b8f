//! Resource ceiling and request resolution, applied once before any worker
//! starts.

use std::fs;
use std::time::Duration;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::{info, warn};

use super::meter::logical_core_count;
use super::{Backend, EngineError, LoadPlan, LoadTarget, PlannedLoad, RunRequest, MAX_RUN_DURATION, MIB};

/// Fraction of currently available memory a RAM run may claim.
pub const DEFAULT_MEMORY_CEILING: f64 = 0.75;

/// Source of the "currently available memory" figure.
pub trait MemoryProbe: Send + Sync {
    /// Bytes available to new allocations, or `None` if unknown.
    fn available_bytes(&self) -> Option<u64>;
}

/// Host memory via sysinfo, with `/proc/meminfo` as a fallback.
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> Option<u64> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
        );
        match sys.available_memory() {
            0 => meminfo_available(),
            bytes => Some(bytes),
        }
    }
}

/// Parse `MemAvailable:` (kB) from `/proc/meminfo`.
fn meminfo_available() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Turns a [`RunRequest`] into a [`LoadPlan`]: fills in defaults and caps the
/// RAM target so the host is not pushed into swap or the OOM killer.
///
/// Oversized requests are downgraded, never rejected.
pub struct SafetyGuard {
    memory: Box<dyn MemoryProbe>,
    ceiling: f64,
    logical_cores: usize,
}

impl SafetyGuard {
    pub fn new(memory: Box<dyn MemoryProbe>) -> Self {
        Self {
            memory,
            ceiling: DEFAULT_MEMORY_CEILING,
            logical_cores: logical_core_count(),
        }
    }

    /// Override the ceiling fraction. Values outside (0, 1] fall back to the
    /// default.
    pub fn with_ceiling(mut self, fraction: f64) -> Self {
        self.ceiling = if fraction > 0.0 && fraction <= 1.0 {
            fraction
        } else {
            warn!(fraction, "ignoring out-of-range memory ceiling");
            DEFAULT_MEMORY_CEILING
        };
        self
    }

    pub fn with_logical_cores(mut self, cores: usize) -> Self {
        self.logical_cores = cores.max(1);
        self
    }

    /// Byte ceiling for RAM runs right now, if available memory is known.
    pub fn ceiling_bytes(&self) -> Option<u64> {
        self.memory
            .available_bytes()
            .map(|avail| (avail as f64 * self.ceiling) as u64)
    }

    /// Cap `requested` at the ceiling. Returns the target and, when it was
    /// reduced or could not be checked, a note for the result.
    pub fn clamp_bytes(&self, requested: u64) -> (u64, Option<String>) {
        match self.ceiling_bytes() {
            Some(ceiling) if requested > ceiling => {
                warn!(
                    requested_mb = requested / MIB,
                    ceiling_mb = ceiling / MIB,
                    "RAM target exceeds safe ceiling, reducing"
                );
                let note = format!(
                    "RAM target reduced from {:.1} MiB to {:.1} MiB ({:.0}% of available memory)",
                    requested as f64 / MIB as f64,
                    ceiling as f64 / MIB as f64,
                    self.ceiling * 100.0
                );
                (ceiling, Some(note))
            }
            Some(_) => (requested, None),
            None => {
                warn!("available memory unknown, RAM target not clamped");
                (
                    requested,
                    Some("available memory unknown; RAM target not clamped".to_string()),
                )
            }
        }
    }

    /// Validate, resolve defaults and clamp.
    pub fn plan(&self, request: &RunRequest) -> Result<(LoadPlan, Vec<String>), EngineError> {
        request.validate()?;

        let mut notes = Vec::new();
        let sample_interval_secs =
            cap_duration("sample interval", request.sample_interval, &mut notes).as_secs_f64();

        let plan = match request.target {
            LoadTarget::Cpu { duration } => LoadPlan {
                load: PlannedLoad::Cpu {
                    duration_secs: cap_duration("duration", duration, &mut notes).as_secs_f64(),
                },
                workers: resolve_workers(request.workers, self.logical_cores),
                sample_interval_secs,
                backend: request.backend,
                clamped: false,
            },
            LoadTarget::Ram {
                total_bytes,
                chunk_bytes,
                passes,
            } => {
                let (target_bytes, clamp_note) = self.clamp_bytes(total_bytes);
                let clamped = target_bytes < total_bytes;
                notes.extend(clamp_note);

                if let Some(workers) = request.workers.filter(|&w| w > 1) {
                    info!(workers, "RAM test drives chunks inline, using a single worker");
                    notes.push(format!(
                        "RAM test runs on one worker; {} requested",
                        workers
                    ));
                }

                let mut backend = request.backend;
                if backend == Backend::StressNg {
                    notes.push(
                        "stress-ng backend applies to CPU runs only; RAM test used the built-in chunk loop"
                            .to_string(),
                    );
                    backend = Backend::Builtin;
                }

                LoadPlan {
                    load: PlannedLoad::Ram {
                        requested_bytes: total_bytes,
                        target_bytes,
                        chunk_bytes,
                        passes,
                    },
                    workers: 1,
                    sample_interval_secs,
                    backend,
                    clamped,
                }
            }
        };

        Ok((plan, notes))
    }
}

/// Durations above [`MAX_RUN_DURATION`] are reduced to it, with a note.
fn cap_duration(what: &str, value: Duration, notes: &mut Vec<String>) -> Duration {
    if value <= MAX_RUN_DURATION {
        return value;
    }
    warn!(what, requested_secs = value.as_secs(), "capping oversized duration");
    notes.push(format!(
        "{what} capped at {} s ({} s requested)",
        MAX_RUN_DURATION.as_secs(),
        value.as_secs()
    ));
    MAX_RUN_DURATION
}

/// Configuration-resolution step: an unset worker count means one per
/// logical core.
pub fn resolve_workers(requested: Option<usize>, logical_cores: usize) -> usize {
    requested.unwrap_or(logical_cores).max(1)
}
