//! Reduction of a run's raw samples into the result handed back to the
//! caller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sample::{CpuSample, RamSample, Sample};
use super::{LoadKind, LoadPlan, MIB};

/// Floor for elapsed time in throughput math.
pub const MIN_ELAPSED_SECS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Ok,
    Fail,
    Unsupported,
}

impl RunStatus {
    /// Status depends on recorded errors only, never on cancellation.
    pub fn from_errors(errors: &[String]) -> Self {
        if errors.is_empty() {
            RunStatus::Ok
        } else {
            RunStatus::Fail
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "OK"),
            RunStatus::Fail => write!(f, "FAIL"),
            RunStatus::Unsupported => write!(f, "UNSUPPORTED"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuSummary {
    /// Mean of the per-sample averages.
    pub average_utilization: f64,
    /// Mean utilization of each core across samples.
    pub per_core_utilization: Vec<f64>,
    pub samples_count: usize,
    pub max_temperature_c: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RamSummary {
    /// Largest extent verified within one pass.
    pub tested_bytes: u64,
    pub tested_mb: f64,
    /// All bytes written and verified across passes.
    pub processed_bytes: u64,
    pub throughput_mb_s: f64,
    pub write_mb_s: f64,
    pub read_mb_s: f64,
    pub passes_completed: u32,
    pub chunks: usize,
    /// Chunks whose read-back did not match.
    pub fault_count: usize,
    pub allocation_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Summary {
    Cpu(CpuSummary),
    Ram(RamSummary),
}

impl Summary {
    pub fn empty(kind: LoadKind) -> Self {
        match kind {
            LoadKind::Cpu => Summary::Cpu(CpuSummary::default()),
            LoadKind::Ram => Summary::Ram(RamSummary::default()),
        }
    }
}

/// The reduced form of one run. Plain data, ready for the report builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub kind: LoadKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    /// Whether the run's token was cancelled before it finished.
    pub cancelled: bool,
    /// Effective (resolved, clamped) plan; absent if the request was invalid.
    pub plan: Option<LoadPlan>,
    pub summary: Summary,
    pub errors: Vec<String>,
    pub notes: Vec<String>,
    pub samples: Vec<Sample>,
}

impl RunResult {
    /// Result for a run that could not start.
    pub fn setup_failure(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        kind: LoadKind,
        plan: Option<LoadPlan>,
        error: String,
        notes: Vec<String>,
    ) -> Self {
        Self {
            run_id,
            kind,
            status: RunStatus::Fail,
            started_at,
            elapsed_secs: 0.0,
            cancelled: false,
            plan,
            summary: Summary::empty(kind),
            errors: vec![error],
            notes,
            samples: Vec::new(),
        }
    }

    /// Result for a run this host cannot perform.
    pub fn unsupported(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        plan: LoadPlan,
        reason: String,
        mut notes: Vec<String>,
    ) -> Self {
        let kind = plan.kind();
        notes.push(reason);
        Self {
            run_id,
            kind,
            status: RunStatus::Unsupported,
            started_at,
            elapsed_secs: 0.0,
            cancelled: false,
            plan: Some(plan),
            summary: Summary::empty(kind),
            errors: Vec::new(),
            notes,
            samples: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }

    pub fn cpu_summary(&self) -> Option<&CpuSummary> {
        match &self.summary {
            Summary::Cpu(s) => Some(s),
            Summary::Ram(_) => None,
        }
    }

    pub fn ram_summary(&self) -> Option<&RamSummary> {
        match &self.summary {
            Summary::Ram(s) => Some(s),
            Summary::Cpu(_) => None,
        }
    }

    /// Measurement samples, without error entries.
    pub fn valid_samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(|s| !s.is_error())
    }
}

/// Everything a finished (or cancelled) run hands to the aggregator.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub plan: LoadPlan,
    pub samples: Vec<Sample>,
    pub errors: Vec<String>,
    pub allocation_failures: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
    pub notes: Vec<String>,
}

/// Reduce a run to its result. Deterministic for a given outcome; tolerates
/// partial and empty sample sets.
pub fn reduce(outcome: RunOutcome) -> RunResult {
    let kind = outcome.plan.kind();
    let summary = match kind {
        LoadKind::Cpu => Summary::Cpu(summarize_cpu(&outcome.samples)),
        LoadKind::Ram => Summary::Ram(summarize_ram(
            &outcome.samples,
            outcome.plan.target_bytes().unwrap_or(0),
            outcome.elapsed,
            outcome.allocation_failures,
        )),
    };

    RunResult {
        run_id: outcome.run_id,
        kind,
        status: RunStatus::from_errors(&outcome.errors),
        started_at: outcome.started_at,
        elapsed_secs: outcome.elapsed.as_secs_f64(),
        cancelled: outcome.cancelled,
        plan: Some(outcome.plan),
        summary,
        errors: outcome.errors,
        notes: outcome.notes,
        samples: outcome.samples,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub fn summarize_cpu(samples: &[Sample]) -> CpuSummary {
    let valid: Vec<&CpuSample> = samples
        .iter()
        .filter_map(|s| match s {
            Sample::Cpu(c) => Some(c),
            _ => None,
        })
        .collect();

    let Some(first) = valid.first() else {
        return CpuSummary::default();
    };

    // Core count is taken from the first sample; shorter samples just
    // contribute to fewer cores.
    let per_core_utilization = (0..first.per_core_utilization.len())
        .map(|core| {
            mean(
                valid
                    .iter()
                    .filter_map(|s| s.per_core_utilization.get(core))
                    .map(|&v| f64::from(v)),
            )
        })
        .collect();

    CpuSummary {
        average_utilization: mean(valid.iter().map(|s| f64::from(s.average_utilization))),
        per_core_utilization,
        samples_count: valid.len(),
        max_temperature_c: valid.iter().filter_map(|s| s.max_temperature()).reduce(f32::max),
    }
}

pub fn summarize_ram(
    samples: &[Sample],
    target_bytes: u64,
    elapsed: Duration,
    allocation_failures: usize,
) -> RamSummary {
    let chunks: Vec<&RamSample> = samples
        .iter()
        .filter_map(|s| match s {
            Sample::Ram(r) => Some(r),
            _ => None,
        })
        .collect();

    let tested_bytes = chunks
        .iter()
        .map(|c| c.cumulative_tested_bytes)
        .max()
        .unwrap_or(0);
    let processed_bytes: u64 = chunks.iter().map(|c| c.chunk_bytes).sum();
    let processed_mb = processed_bytes as f64 / MIB as f64;

    let rate = |secs: f64| {
        if processed_bytes == 0 {
            0.0
        } else {
            processed_mb / secs.max(MIN_ELAPSED_SECS)
        }
    };
    let write_secs: f64 = chunks.iter().map(|c| c.chunk_write_seconds).sum();
    let read_secs: f64 = chunks.iter().map(|c| c.chunk_read_seconds).sum();

    let mut full_passes: Vec<u32> = chunks
        .iter()
        .filter(|c| target_bytes > 0 && c.cumulative_tested_bytes >= target_bytes)
        .map(|c| c.pass_index)
        .collect();
    full_passes.dedup();

    RamSummary {
        tested_bytes,
        tested_mb: tested_bytes as f64 / MIB as f64,
        processed_bytes,
        throughput_mb_s: rate(elapsed.as_secs_f64()),
        write_mb_s: rate(write_secs),
        read_mb_s: rate(read_secs),
        passes_completed: full_passes.len() as u32,
        chunks: chunks.len(),
        fault_count: chunks.iter().filter(|c| !c.verification_ok).count(),
        allocation_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sample::{ErrorOrigin, ErrorSample, TemperatureReading};
    use crate::engine::{Backend, PlannedLoad};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cpu(secs: i64, cores: Vec<f32>, temp: Option<f32>) -> Sample {
        let temps = temp.map(|celsius| {
            vec![TemperatureReading {
                label: "cpu".into(),
                celsius,
            }]
        });
        Sample::Cpu(CpuSample::new(ts(secs), cores, temps))
    }

    fn ram(pass: u32, cumulative: u64, chunk: u64, ok: bool) -> Sample {
        Sample::Ram(RamSample {
            timestamp: ts(0),
            pass_index: pass,
            cumulative_tested_bytes: cumulative,
            chunk_bytes: chunk,
            chunk_write_seconds: 0.01,
            chunk_read_seconds: 0.005,
            verification_ok: ok,
        })
    }

    fn error_sample() -> Sample {
        Sample::Error(ErrorSample {
            timestamp: ts(1),
            error: "tick failed".into(),
            origin: ErrorOrigin::Tick,
        })
    }

    fn outcome(plan: LoadPlan, samples: Vec<Sample>, errors: Vec<String>) -> RunOutcome {
        RunOutcome {
            run_id: Uuid::nil(),
            started_at: ts(0),
            plan,
            samples,
            errors,
            allocation_failures: 0,
            elapsed: Duration::from_secs(2),
            cancelled: false,
            notes: Vec::new(),
        }
    }

    fn cpu_plan() -> LoadPlan {
        LoadPlan {
            load: PlannedLoad::Cpu { duration_secs: 2.0 },
            workers: 2,
            sample_interval_secs: 1.0,
            backend: Backend::Builtin,
            clamped: false,
        }
    }

    fn ram_plan(target: u64) -> LoadPlan {
        LoadPlan {
            load: PlannedLoad::Ram {
                requested_bytes: target,
                target_bytes: target,
                chunk_bytes: 16 * MIB,
                passes: 2,
            },
            workers: 1,
            sample_interval_secs: 1.0,
            backend: Backend::Builtin,
            clamped: false,
        }
    }

    #[test]
    fn test_cpu_averages_skip_error_entries() {
        let samples = vec![
            cpu(1, vec![100.0, 50.0], Some(50.0)),
            error_sample(),
            cpu(2, vec![80.0, 30.0], Some(63.5)),
        ];
        let s = summarize_cpu(&samples);
        assert_eq!(s.samples_count, 2);
        assert_eq!(s.per_core_utilization, vec![90.0, 40.0]);
        assert_eq!(s.average_utilization, 65.0);
        assert_eq!(s.max_temperature_c, Some(63.5));
    }

    #[test]
    fn test_reduce_is_deterministic() {
        let samples = vec![cpu(1, vec![12.5, 99.0, 3.0], None), cpu(2, vec![7.0, 100.0, 0.0], None)];
        let a = reduce(outcome(cpu_plan(), samples.clone(), Vec::new()));
        let b = reduce(outcome(cpu_plan(), samples, Vec::new()));
        assert_eq!(a, b);
        assert_eq!(a.status, RunStatus::Ok);
    }

    #[test]
    fn test_zero_samples_gives_zero_summary() {
        let result = reduce(outcome(cpu_plan(), Vec::new(), Vec::new()));
        assert_eq!(result.status, RunStatus::Ok);
        let s = result.cpu_summary().unwrap();
        assert_eq!(s.average_utilization, 0.0);
        assert!(s.per_core_utilization.is_empty());
        assert_eq!(s.max_temperature_c, None);

        let result = reduce(outcome(ram_plan(64 * MIB), Vec::new(), Vec::new()));
        let s = result.ram_summary().unwrap();
        assert_eq!(s.tested_bytes, 0);
        assert_eq!(s.throughput_mb_s, 0.0);
        assert_eq!(s.write_mb_s, 0.0);
    }

    #[test]
    fn test_status_follows_errors_not_cancellation() {
        let mut cancelled = outcome(cpu_plan(), vec![cpu(1, vec![50.0], None)], Vec::new());
        cancelled.cancelled = true;
        let result = reduce(cancelled);
        assert_eq!(result.status, RunStatus::Ok);
        assert!(result.cancelled);

        let failed = reduce(outcome(cpu_plan(), Vec::new(), vec!["boom".into()]));
        assert_eq!(failed.status, RunStatus::Fail);
    }

    #[test]
    fn test_ram_summary_two_passes() {
        let samples = vec![
            ram(1, 16 * MIB, 16 * MIB, true),
            ram(1, 32 * MIB, 16 * MIB, false),
            ram(2, 16 * MIB, 16 * MIB, true),
            ram(2, 32 * MIB, 16 * MIB, true),
        ];
        let s = summarize_ram(&samples, 32 * MIB, Duration::from_secs(2), 0);
        assert_eq!(s.tested_bytes, 32 * MIB);
        assert_eq!(s.tested_mb, 32.0);
        assert_eq!(s.processed_bytes, 64 * MIB);
        assert_eq!(s.throughput_mb_s, 32.0);
        assert_eq!(s.passes_completed, 2);
        assert_eq!(s.chunks, 4);
        assert_eq!(s.fault_count, 1);
        assert!((s.write_mb_s - 64.0 / 0.04).abs() < 1e-6);
    }

    #[test]
    fn test_ram_partial_pass_not_counted() {
        let samples = vec![ram(1, 16 * MIB, 16 * MIB, true)];
        let s = summarize_ram(&samples, 64 * MIB, Duration::from_secs(1), 1);
        assert_eq!(s.passes_completed, 0);
        assert_eq!(s.allocation_failures, 1);
    }

    #[test]
    fn test_elapsed_is_floored() {
        let samples = vec![ram(1, MIB, MIB, true)];
        let s = summarize_ram(&samples, MIB, Duration::ZERO, 0);
        assert!(s.throughput_mb_s.is_finite());
        assert_eq!(s.throughput_mb_s, 1.0 / MIN_ELAPSED_SECS);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(RunStatus::Ok).unwrap(), "OK");
        assert_eq!(serde_json::to_value(RunStatus::Unsupported).unwrap(), "UNSUPPORTED");
        assert_eq!(RunStatus::Fail.to_string(), "FAIL");
    }

    #[test]
    fn test_result_json_shape() {
        let result = reduce(outcome(ram_plan(32 * MIB), vec![ram(1, 32 * MIB, 32 * MIB, true)], Vec::new()));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "OK");
        assert_eq!(json["kind"], "ram");
        assert_eq!(json["summary"]["kind"], "ram");
        assert_eq!(json["summary"]["tested_mb"], 32.0);
        assert_eq!(json["samples"][0]["type"], "ram");
        assert_eq!(json["plan"]["target_bytes"], 32 * MIB);
    }
}
