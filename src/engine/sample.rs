//! Immutable measurement records produced by the sampling loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a run's append-only sample sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sample {
    Cpu(CpuSample),
    Ram(RamSample),
    /// A tick or callback that failed. Kept in the raw list, skipped by the
    /// numeric aggregation.
    Error(ErrorSample),
}

impl Sample {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Sample::Cpu(s) => s.timestamp,
            Sample::Ram(s) => s.timestamp,
            Sample::Error(s) => s.timestamp,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Sample::Error(_))
    }
}

/// Utilization over one sampling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub timestamp: DateTime<Utc>,
    /// Percent busy per logical core, 0..=100.
    pub per_core_utilization: Vec<f32>,
    pub average_utilization: f32,
    /// `None` when no sensor could be read.
    pub temperatures: Option<Vec<TemperatureReading>>,
}

impl CpuSample {
    pub fn new(
        timestamp: DateTime<Utc>,
        per_core_utilization: Vec<f32>,
        temperatures: Option<Vec<TemperatureReading>>,
    ) -> Self {
        let average_utilization = if per_core_utilization.is_empty() {
            0.0
        } else {
            per_core_utilization.iter().sum::<f32>() / per_core_utilization.len() as f32
        };
        Self {
            timestamp,
            per_core_utilization,
            average_utilization,
            temperatures,
        }
    }

    pub fn max_temperature(&self) -> Option<f32> {
        self.temperatures
            .as_ref()?
            .iter()
            .map(|t| t.celsius)
            .reduce(f32::max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub label: String,
    pub celsius: f32,
}

/// Outcome of one write/verify chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamSample {
    pub timestamp: DateTime<Utc>,
    /// 1-based pass number.
    pub pass_index: u32,
    /// Bytes verified so far within this pass, including this chunk.
    pub cumulative_tested_bytes: u64,
    pub chunk_bytes: u64,
    pub chunk_write_seconds: f64,
    pub chunk_read_seconds: f64,
    pub verification_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub origin: ErrorOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    /// The measurement itself failed.
    Tick,
    /// The caller's progress callback returned an error or panicked.
    Callback,
}
