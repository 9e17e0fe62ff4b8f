//! Load-generation and sampling engine shared by the CPU and RAM diagnostics.
//!
//! A run goes through the same sequence regardless of kind:
//! request -> [`guard::SafetyGuard`] (resolve + clamp) -> workers and sampling
//! loop run concurrently -> deadline, target or cancellation -> workers
//! stopped -> [`aggregate::reduce`] -> [`RunResult`].
//!
//! The engine never panics or returns an error to its caller: every failure
//! ends up inside the returned [`RunResult`].

pub mod aggregate;
pub mod cancel;
pub mod guard;
pub mod memory;
pub mod meter;
pub mod pool;
pub mod sample;
pub mod sampler;
pub mod stress_ng;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

pub use aggregate::{CpuSummary, RamSummary, RunOutcome, RunResult, RunStatus, Summary};
pub use cancel::CancellationToken;
pub use sample::{CpuSample, ErrorOrigin, ErrorSample, RamSample, Sample, TemperatureReading};

use crate::config::EngineConfig;
use guard::{SafetyGuard, SystemMemory};
use memory::{BufferProvider, HeapBuffers};
use meter::{SysinfoMeter, SystemThermal, ThermalSource, UtilizationSource};
use pool::{ThreadPool, WorkerPool, DEFAULT_STOP_GRACE};
use sampler::{CpuSampler, RamSampler, SampleLog};
use stress_ng::StressNgPool;

pub const MIB: u64 = 1024 * 1024;

/// Longest CPU run or sampling interval a plan will carry. Longer requests
/// are reduced to this.
pub const MAX_RUN_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(MAX_RUN_DURATION)
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn load workers: {0}")]
    SpawnFailed(String),

    #[error("measurement source unavailable: {0}")]
    MeasurementUnavailable(String),

    #[error("allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: u64, reason: String },

    #[error("{0} is not supported on this platform")]
    Unsupported(String),
}

/// Which resource a run puts under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadKind {
    Cpu,
    Ram,
}

impl std::fmt::Display for LoadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadKind::Cpu => write!(f, "cpu"),
            LoadKind::Ram => write!(f, "ram"),
        }
    }
}

/// Load generator implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// In-process OS threads.
    #[default]
    Builtin,
    /// External `stress-ng` processes (CPU only).
    StressNg,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Builtin => write!(f, "builtin"),
            Backend::StressNg => write!(f, "stress-ng"),
        }
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadTarget {
    Cpu {
        duration: Duration,
    },
    Ram {
        total_bytes: u64,
        chunk_bytes: u64,
        passes: u32,
    },
}

/// A load test request, consumed once by [`LoadEngine::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub target: LoadTarget,
    /// `None` resolves to the logical core count.
    pub workers: Option<usize>,
    /// Length of one CPU sampling window. Ignored by RAM runs, which emit a
    /// sample per chunk.
    pub sample_interval: Duration,
    pub backend: Backend,
}

impl RunRequest {
    pub fn cpu(duration: Duration) -> Self {
        Self {
            target: LoadTarget::Cpu { duration },
            workers: None,
            sample_interval: Duration::from_secs(1),
            backend: Backend::Builtin,
        }
    }

    /// Short CPU check used by the dashboard's quick mode.
    pub fn cpu_quick() -> Self {
        Self::cpu(Duration::from_secs(3))
    }

    pub fn ram(total_bytes: u64, chunk_bytes: u64, passes: u32) -> Self {
        Self {
            target: LoadTarget::Ram {
                total_bytes,
                chunk_bytes,
                passes,
            },
            workers: None,
            sample_interval: Duration::from_secs(1),
            backend: Backend::Builtin,
        }
    }

    /// RAM request in megabytes. Chunk size and pass count are floored at 1.
    pub fn ram_mb(total_mb: u64, chunk_mb: u64, passes: u32) -> Self {
        Self::ram(
            total_mb.saturating_mul(MIB),
            chunk_mb.max(1).saturating_mul(MIB),
            passes.max(1),
        )
    }

    pub fn ram_quick() -> Self {
        Self::ram_mb(64, 16, 1)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn kind(&self) -> LoadKind {
        match self.target {
            LoadTarget::Cpu { .. } => LoadKind::Cpu,
            LoadTarget::Ram { .. } => LoadKind::Ram,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == Some(0) {
            return Err(EngineError::InvalidRequest(
                "worker count must be at least 1".into(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(EngineError::InvalidRequest(
                "sample interval must be positive".into(),
            ));
        }
        match self.target {
            LoadTarget::Cpu { duration } if duration.is_zero() => Err(
                EngineError::InvalidRequest("duration must be positive".into()),
            ),
            LoadTarget::Ram { total_bytes: 0, .. } => Err(EngineError::InvalidRequest(
                "total size must be positive".into(),
            )),
            LoadTarget::Ram { chunk_bytes: 0, .. } => Err(EngineError::InvalidRequest(
                "chunk size must be positive".into(),
            )),
            LoadTarget::Ram { passes: 0, .. } => Err(EngineError::InvalidRequest(
                "pass count must be at least 1".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Kind-specific part of a resolved plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlannedLoad {
    Cpu {
        duration_secs: f64,
    },
    Ram {
        /// What the caller asked for, before clamping.
        requested_bytes: u64,
        /// What the run tests per pass.
        target_bytes: u64,
        chunk_bytes: u64,
        passes: u32,
    },
}

/// A request after configuration resolution and safety clamping. This, not the
/// original request, is reported in the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPlan {
    #[serde(flatten)]
    pub load: PlannedLoad,
    pub workers: usize,
    pub sample_interval_secs: f64,
    pub backend: Backend,
    /// True when the SafetyGuard reduced the requested size.
    pub clamped: bool,
}

impl LoadPlan {
    pub fn kind(&self) -> LoadKind {
        match self.load {
            PlannedLoad::Cpu { .. } => LoadKind::Cpu,
            PlannedLoad::Ram { .. } => LoadKind::Ram,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self.load {
            PlannedLoad::Cpu { duration_secs } => Some(secs_to_duration(duration_secs)),
            PlannedLoad::Ram { .. } => None,
        }
    }

    pub fn target_bytes(&self) -> Option<u64> {
        match self.load {
            PlannedLoad::Cpu { .. } => None,
            PlannedLoad::Ram { target_bytes, .. } => Some(target_bytes),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        secs_to_duration(self.sample_interval_secs)
    }
}

/// Progress hook invoked once per measurement sample, in order, on the
/// sampling thread. Errors and panics are contained by the engine.
pub type Progress<'a> = &'a mut dyn FnMut(&Sample) -> anyhow::Result<()>;

/// Owned progress hook for [`run_load_test_async`].
pub type ProgressCallback = Box<dyn FnMut(&Sample) -> anyhow::Result<()> + Send>;

type MeterFactory = Box<dyn Fn() -> Box<dyn UtilizationSource> + Send + Sync>;

/// Identity and clock of one run.
struct RunHeader {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
}

/// Coordinates one load test at a time per call to [`LoadEngine::run`].
///
/// Measurement sources are injectable so callers (and tests) can substitute
/// hardware access.
pub struct LoadEngine {
    guard: SafetyGuard,
    meter: MeterFactory,
    thermal: Arc<dyn ThermalSource>,
    buffers: Arc<dyn BufferProvider>,
    stop_grace: Duration,
}

impl Default for LoadEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadEngine {
    pub fn new() -> Self {
        Self {
            guard: SafetyGuard::new(Box::new(SystemMemory)),
            meter: Box::new(|| Box::new(SysinfoMeter::new())),
            thermal: Arc::new(SystemThermal),
            buffers: Arc::new(HeapBuffers),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            guard: SafetyGuard::new(Box::new(SystemMemory))
                .with_ceiling(config.safety.memory_ceiling),
            stop_grace: Duration::from_millis(config.safety.stop_grace_ms),
            ..Self::new()
        }
    }

    pub fn with_guard(mut self, guard: SafetyGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_cpu_meter<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn UtilizationSource> + Send + Sync + 'static,
    {
        self.meter = Box::new(factory);
        self
    }

    pub fn with_thermal(mut self, thermal: Arc<dyn ThermalSource>) -> Self {
        self.thermal = thermal;
        self
    }

    pub fn with_buffers(mut self, buffers: Arc<dyn BufferProvider>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Run one load test on the calling thread. Blocks until the deadline,
    /// target or cancellation, then returns the reduced result.
    pub fn run(
        &self,
        request: RunRequest,
        progress: Option<Progress<'_>>,
        token: Option<CancellationToken>,
    ) -> RunResult {
        let header = RunHeader {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
        };
        let kind = request.kind();
        let span = info_span!("load_test", run_id = %header.run_id, %kind);
        let _entered = span.enter();

        let token = token.unwrap_or_default();

        let (plan, notes) = match self.guard.plan(&request) {
            Ok(planned) => planned,
            Err(e) => {
                error!(error = %e, "load test rejected");
                return RunResult::setup_failure(
                    header.run_id,
                    header.started_at,
                    kind,
                    None,
                    e.to_string(),
                    Vec::new(),
                );
            }
        };
        info!(workers = plan.workers, backend = %plan.backend, clamped = plan.clamped, "plan resolved");

        match plan.kind() {
            LoadKind::Cpu => self.run_cpu(header, plan, notes, progress, &token),
            LoadKind::Ram => self.run_ram(header, plan, notes, progress, &token),
        }
    }

    fn run_cpu(
        &self,
        header: RunHeader,
        mut plan: LoadPlan,
        mut notes: Vec<String>,
        progress: Option<Progress<'_>>,
        token: &CancellationToken,
    ) -> RunResult {
        let mut meter = (self.meter)();
        if !meter.is_supported() {
            let e = EngineError::Unsupported("CPU utilization sampling".into());
            warn!(error = %e, "skipping CPU load test");
            return RunResult::unsupported(header.run_id, header.started_at, plan, e.to_string(), notes);
        }

        let min_window = meter.min_window();
        if plan.sample_interval() < min_window {
            info!(?min_window, "sample interval below meter resolution, widening");
            notes.push(format!(
                "sample interval raised from {:.3} s to {:.3} s (shortest window the CPU meter can resolve)",
                plan.sample_interval_secs,
                min_window.as_secs_f64()
            ));
            plan.sample_interval_secs = min_window.as_secs_f64();
        }

        let duration = plan.duration().unwrap_or_default();
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .or_else(|| now.checked_add(MAX_RUN_DURATION))
            .unwrap_or(now);

        let pool = self.select_pool(&mut plan, &mut notes);
        let mut handle = match pool.start(&plan, deadline, token) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, backend = pool.name(), "could not start load workers");
                return RunResult::setup_failure(
                    header.run_id,
                    header.started_at,
                    LoadKind::Cpu,
                    Some(plan),
                    e.to_string(),
                    notes,
                );
            }
        };
        info!(backend = pool.name(), workers = handle.len(), ?duration, "load workers started");

        let mut log = SampleLog::new(progress);
        for e in handle.take_spawn_errors() {
            log.error(e);
        }

        CpuSampler::new(meter.as_mut(), self.thermal.as_ref()).run(
            plan.sample_interval(),
            deadline,
            token,
            &mut log,
        );

        let cancelled = token.is_cancelled();
        let stopped = handle.stop(self.stop_grace);
        info!(
            exited = stopped.exited,
            killed = stopped.killed,
            detached = stopped.detached,
            cancelled,
            "load workers stopped"
        );

        let (samples, errors) = log.into_parts();
        aggregate::reduce(RunOutcome {
            run_id: header.run_id,
            started_at: header.started_at,
            plan,
            samples,
            errors,
            allocation_failures: 0,
            elapsed: header.clock.elapsed(),
            cancelled,
            notes,
        })
    }

    fn run_ram(
        &self,
        header: RunHeader,
        plan: LoadPlan,
        notes: Vec<String>,
        progress: Option<Progress<'_>>,
        token: &CancellationToken,
    ) -> RunResult {
        let mut log = SampleLog::new(progress);
        let allocation_failures = match plan.load {
            PlannedLoad::Ram {
                target_bytes,
                chunk_bytes,
                passes,
                ..
            } => RamSampler::new(self.buffers.as_ref()).run(
                target_bytes,
                chunk_bytes,
                passes,
                token,
                &mut log,
            ),
            PlannedLoad::Cpu { .. } => 0,
        };

        let cancelled = token.is_cancelled();
        let (samples, errors) = log.into_parts();
        aggregate::reduce(RunOutcome {
            run_id: header.run_id,
            started_at: header.started_at,
            plan,
            samples,
            errors,
            allocation_failures,
            elapsed: header.clock.elapsed(),
            cancelled,
            notes,
        })
    }

    fn select_pool(&self, plan: &mut LoadPlan, notes: &mut Vec<String>) -> Box<dyn WorkerPool> {
        match plan.backend {
            Backend::Builtin => Box::new(ThreadPool),
            Backend::StressNg => {
                let stress_ng = StressNgPool::new();
                if stress_ng.is_available() {
                    Box::new(stress_ng)
                } else {
                    warn!("stress-ng not found, falling back to built-in load workers");
                    notes.push("stress-ng not installed; used built-in load workers".into());
                    plan.backend = Backend::Builtin;
                    Box::new(ThreadPool)
                }
            }
        }
    }
}

/// Run a load test with the default engine on the calling thread.
///
/// A token is created internally when `token` is `None`.
pub fn run_load_test(
    request: RunRequest,
    progress: Option<Progress<'_>>,
    token: Option<CancellationToken>,
) -> RunResult {
    LoadEngine::new().run(request, progress, token)
}

/// Run a load test on tokio's blocking pool so async callers stay responsive.
///
/// Cancel through `token`; the returned future always resolves to a result.
pub async fn run_load_test_async(
    engine: Arc<LoadEngine>,
    request: RunRequest,
    progress: Option<ProgressCallback>,
    token: Option<CancellationToken>,
) -> RunResult {
    let kind = request.kind();
    let token = token.unwrap_or_default();

    let task = tokio::task::spawn_blocking(move || {
        let mut progress = progress;
        let hook: Option<Progress<'_>> = match progress.as_mut() {
            Some(p) => Some(p.as_mut()),
            None => None,
        };
        engine.run(request, hook, Some(token))
    });

    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "load test task failed");
            RunResult::setup_failure(
                Uuid::new_v4(),
                Utc::now(),
                kind,
                None,
                format!("load test task failed: {e}"),
                Vec::new(),
            )
        }
    }
}
