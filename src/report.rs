//! Human-readable rendering of samples and run results for the CLI.

use std::fmt::Write as _;

use crate::engine::{
    CpuSummary, ErrorOrigin, LoadKind, RamSummary, RunResult, Sample, Summary, MIB,
};

/// One progress line per sample.
pub fn format_sample_line(sample: &Sample) -> String {
    let time = sample.timestamp().format("%H:%M:%S");
    match sample {
        Sample::Cpu(s) => {
            let mut line = format!(
                "[{time}] cpu avg {:5.1}% | cores: {}",
                s.average_utilization,
                s.per_core_utilization
                    .iter()
                    .map(|u| format!("{u:.0}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            if let Some(t) = s.max_temperature() {
                let _ = write!(line, " | {t:.1}°C");
            }
            line
        }
        Sample::Ram(s) => format!(
            "[{time}] ram pass {} | {:.0} MB tested | chunk {:.0} MB w {:.3}s r {:.3}s | {}",
            s.pass_index,
            s.cumulative_tested_bytes as f64 / MIB as f64,
            s.chunk_bytes as f64 / MIB as f64,
            s.chunk_write_seconds,
            s.chunk_read_seconds,
            if s.verification_ok { "ok" } else { "MISMATCH" },
        ),
        Sample::Error(e) => {
            let origin = match e.origin {
                ErrorOrigin::Tick => "sampling",
                ErrorOrigin::Callback => "progress",
            };
            format!("[{time}] {origin} error: {}", e.error)
        }
    }
}

/// Multi-line summary of a finished run.
pub fn format_summary(result: &RunResult) -> String {
    let mut out = format!(
        "{} test: {} ({:.1}s{})",
        match result.kind {
            LoadKind::Cpu => "CPU",
            LoadKind::Ram => "RAM",
        },
        result.status,
        result.elapsed_secs,
        if result.cancelled { ", cancelled" } else { "" },
    );

    if let Some(plan) = &result.plan {
        let _ = write!(out, "\n  workers: {}, backend: {}", plan.workers, plan.backend);
        if plan.clamped {
            out.push_str(", size clamped");
        }
    }

    match &result.summary {
        Summary::Cpu(s) => push_cpu(&mut out, s),
        Summary::Ram(s) => push_ram(&mut out, s),
    }

    for note in &result.notes {
        let _ = write!(out, "\n  note: {note}");
    }
    for error in &result.errors {
        let _ = write!(out, "\n  error: {error}");
    }
    out
}

fn push_cpu(out: &mut String, s: &CpuSummary) {
    let _ = write!(
        out,
        "\n  average utilization: {:.1}% over {} sample{}",
        s.average_utilization,
        s.samples_count,
        if s.samples_count == 1 { "" } else { "s" },
    );
    if !s.per_core_utilization.is_empty() {
        let cores = s
            .per_core_utilization
            .iter()
            .enumerate()
            .map(|(i, u)| format!("cpu{i} {u:.1}%"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(out, "\n  per core: {cores}");
    }
    match s.max_temperature_c {
        Some(t) => {
            let _ = write!(out, "\n  peak temperature: {t:.1}°C");
        }
        None => out.push_str("\n  peak temperature: n/a"),
    }
}

fn push_ram(out: &mut String, s: &RamSummary) {
    let _ = write!(
        out,
        "\n  tested: {:.1} MB, {} pass{} completed, {} chunk{}",
        s.tested_mb,
        s.passes_completed,
        if s.passes_completed == 1 { "" } else { "es" },
        s.chunks,
        if s.chunks == 1 { "" } else { "s" },
    );
    let _ = write!(
        out,
        "\n  throughput: {:.1} MB/s (write {:.1} MB/s, read {:.1} MB/s)",
        s.throughput_mb_s, s.write_mb_s, s.read_mb_s
    );
    if s.fault_count > 0 || s.allocation_failures > 0 {
        let _ = write!(
            out,
            "\n  faults: {}, allocation failures: {}",
            s.fault_count, s.allocation_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        Backend, CpuSample, ErrorSample, LoadPlan, PlannedLoad, RamSample, RunStatus,
        TemperatureReading,
    };
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn cpu_result() -> RunResult {
        RunResult {
            run_id: Uuid::nil(),
            kind: LoadKind::Cpu,
            status: RunStatus::Ok,
            started_at: Utc.timestamp_opt(0, 0).unwrap(),
            elapsed_secs: 2.04,
            cancelled: false,
            plan: Some(LoadPlan {
                load: PlannedLoad::Cpu { duration_secs: 2.0 },
                workers: 4,
                sample_interval_secs: 1.0,
                backend: Backend::Builtin,
                clamped: false,
            }),
            summary: Summary::Cpu(CpuSummary {
                average_utilization: 97.25,
                per_core_utilization: vec![99.0, 95.5],
                samples_count: 2,
                max_temperature_c: Some(61.2),
            }),
            errors: Vec::new(),
            notes: Vec::new(),
            samples: Vec::new(),
        }
    }

    #[test]
    fn test_cpu_summary() {
        let text = format_summary(&cpu_result());
        assert!(text.starts_with("CPU test: OK (2.0s)"));
        assert!(text.contains("workers: 4, backend: builtin"));
        assert!(text.contains("97.2% over 2 samples") || text.contains("97.3% over 2 samples"));
        assert!(text.contains("cpu1 95.5%"));
        assert!(text.contains("peak temperature: 61.2°C"));
    }

    #[test]
    fn test_failed_ram_summary_lists_errors() {
        let result = RunResult {
            kind: LoadKind::Ram,
            status: RunStatus::Fail,
            cancelled: true,
            plan: None,
            summary: Summary::Ram(RamSummary {
                tested_bytes: 64 * MIB,
                tested_mb: 64.0,
                passes_completed: 1,
                chunks: 4,
                fault_count: 1,
                ..RamSummary::default()
            }),
            errors: vec!["Pass 1: data mismatch at offset 0".into()],
            notes: vec!["requested 8192 MB".into()],
            ..cpu_result()
        };
        let text = format_summary(&result);
        assert!(text.starts_with("RAM test: FAIL (2.0s, cancelled)"));
        assert!(text.contains("tested: 64.0 MB, 1 pass completed, 4 chunks"));
        assert!(text.contains("faults: 1, allocation failures: 0"));
        assert!(text.contains("note: requested 8192 MB"));
        assert!(text.contains("error: Pass 1: data mismatch at offset 0"));
    }

    #[test]
    fn test_sample_lines() {
        let ts = Utc.timestamp_opt(3661, 0).unwrap();
        let cpu = Sample::Cpu(CpuSample::new(
            ts,
            vec![100.0, 50.0],
            Some(vec![TemperatureReading {
                label: "cpu_thermal".into(),
                celsius: 55.0,
            }]),
        ));
        let line = format_sample_line(&cpu);
        assert!(line.starts_with("[01:01:01] cpu avg  75.0%"));
        assert!(line.contains("cores: 100 50"));
        assert!(line.ends_with("55.0°C"));

        let ram = Sample::Ram(RamSample {
            timestamp: ts,
            pass_index: 1,
            cumulative_tested_bytes: 32 * MIB,
            chunk_bytes: 16 * MIB,
            chunk_write_seconds: 0.012,
            chunk_read_seconds: 0.008,
            verification_ok: false,
        });
        let line = format_sample_line(&ram);
        assert!(line.contains("32 MB tested"));
        assert!(line.ends_with("MISMATCH"));

        let err = Sample::Error(ErrorSample {
            timestamp: ts,
            error: "display gone".into(),
            origin: ErrorOrigin::Callback,
        });
        assert_eq!(format_sample_line(&err), "[01:01:01] progress error: display gone");
    }
}
