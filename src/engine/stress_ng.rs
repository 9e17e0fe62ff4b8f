//! Alternate CPU load backend driving external `stress-ng` processes.

use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::pool::{PoolHandle, Worker, WorkerPool};
use super::{EngineError, LoadKind, LoadPlan};

/// One `stress-ng --cpu 1` process per worker. Each process carries its own
/// `--timeout`, so it exits at the deadline even if this process dies.
pub struct StressNgPool {
    binary: String,
}

impl StressNgPool {
    pub fn new() -> Self {
        Self::with_binary("stress-ng")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn args(timeout_secs: u64) -> Vec<String> {
        vec![
            "--cpu".to_string(),
            "1".to_string(),
            "--timeout".to_string(),
            format!("{}s", timeout_secs),
            "--quiet".to_string(),
        ]
    }
}

impl Default for StressNgPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool for StressNgPool {
    fn name(&self) -> &'static str {
        "stress-ng"
    }

    fn start(
        &self,
        plan: &LoadPlan,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<PoolHandle, EngineError> {
        if plan.kind() != LoadKind::Cpu {
            return Err(EngineError::Unsupported(format!(
                "{} load via stress-ng",
                plan.kind()
            )));
        }

        // stress-ng only takes whole seconds; round up so it never stops early.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        let args = Self::args(timeout_secs.max(1));

        let mut workers = Vec::with_capacity(plan.workers);
        let mut errors = Vec::new();
        for idx in 0..plan.workers {
            let spawned = Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            match spawned {
                Ok(child) => {
                    debug!(worker = idx, pid = child.id(), "stress-ng worker started");
                    workers.push(Worker::Process(child));
                }
                Err(e) => {
                    warn!(worker = idx, error = %e, "failed to spawn stress-ng");
                    errors.push(format!("worker {idx}: failed to spawn {}: {e}", self.binary));
                }
            }
        }

        if workers.is_empty() {
            return Err(EngineError::SpawnFailed(errors.join("; ")));
        }
        Ok(PoolHandle::new(workers, token.child_token(), errors))
    }
}
