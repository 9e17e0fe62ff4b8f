//! Load workers: independent OS threads (or processes) that burn CPU until
//! the deadline or until told to stop.

use std::process::Child;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::{EngineError, LoadPlan};

/// How long [`PoolHandle::stop`] waits for a graceful exit before forcing.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Arithmetic steps between two checks of the stop flag and deadline.
/// Keeps one iteration well under a millisecond.
const SPIN_BATCH: u32 = 20_000;

/// Starts load workers for a plan.
///
/// Implementations must start exactly `plan.workers` units running truly in
/// parallel, each honoring `deadline` and a child of `token`.
pub trait WorkerPool: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(
        &self,
        plan: &LoadPlan,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<PoolHandle, EngineError>;
}

/// A single running load unit.
pub enum Worker {
    Thread(JoinHandle<()>),
    Process(Child),
}

impl Worker {
    fn is_finished(&mut self) -> bool {
        match self {
            Worker::Thread(handle) => handle.is_finished(),
            Worker::Process(child) => !matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Ask a process to exit. Threads only listen to the token.
    fn request_exit(&mut self) {
        if let Worker::Process(child) = self {
            terminate(child);
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a stale pid at worst yields ESRCH.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM not delivered (process already gone?)");
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// What happened to the workers on shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Exited on their own within the grace period.
    pub exited: usize,
    /// Processes force-killed after the grace period.
    pub killed: usize,
    /// Threads still running after the grace period, left to finish on
    /// their next flag check.
    pub detached: usize,
}

/// Running workers of one run. Dropping the handle stops them.
pub struct PoolHandle {
    workers: Vec<Worker>,
    stop: CancellationToken,
    spawn_errors: Vec<String>,
    stopped: bool,
}

impl PoolHandle {
    pub fn new(workers: Vec<Worker>, stop: CancellationToken, spawn_errors: Vec<String>) -> Self {
        Self {
            workers,
            stop,
            spawn_errors,
            stopped: false,
        }
    }

    /// Number of workers started.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers that have not exited yet.
    pub fn alive(&mut self) -> usize {
        self.workers
            .iter_mut()
            .map(|w| w.is_finished())
            .filter(|done| !done)
            .count()
    }

    /// Workers that failed to start while others did.
    pub fn take_spawn_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.spawn_errors)
    }

    /// Stop all workers: signal, wait up to `grace`, then force. Idempotent.
    /// Shutdown faults are logged, never returned.
    pub fn stop(&mut self, grace: Duration) -> StopReport {
        let mut report = StopReport::default();
        if self.stopped {
            return report;
        }
        self.stopped = true;

        self.stop.cancel();
        for worker in &mut self.workers {
            worker.request_exit();
        }

        let until = Instant::now() + grace;
        while Instant::now() < until && self.workers.iter_mut().any(|w| !w.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }

        for (idx, worker) in self.workers.drain(..).enumerate() {
            match worker {
                Worker::Thread(handle) => {
                    if handle.is_finished() {
                        if handle.join().is_err() {
                            warn!(worker = idx, "load worker panicked");
                        }
                        report.exited += 1;
                    } else {
                        warn!(worker = idx, "load worker still running after grace period, detaching");
                        report.detached += 1;
                    }
                }
                Worker::Process(mut child) => match child.try_wait() {
                    Ok(Some(_)) => report.exited += 1,
                    _ => {
                        if let Err(e) = child.kill() {
                            warn!(worker = idx, error = %e, "failed to kill load process");
                        }
                        if let Err(e) = child.wait() {
                            warn!(worker = idx, error = %e, "failed to reap load process");
                        }
                        report.killed += 1;
                    }
                },
            }
        }

        debug!(?report, "worker pool stopped");
        report
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.stop(DEFAULT_STOP_GRACE);
    }
}

/// In-process pool: one OS thread per worker running [`cpu_burn`].
pub struct ThreadPool;

impl WorkerPool for ThreadPool {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn start(
        &self,
        plan: &LoadPlan,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Result<PoolHandle, EngineError> {
        let stop = token.child_token();
        let mut workers = Vec::with_capacity(plan.workers);
        let mut errors = Vec::new();

        for idx in 0..plan.workers {
            let stop = stop.clone();
            let spawned = thread::Builder::new()
                .name(format!("cpu-burn-{idx}"))
                .spawn(move || {
                    let rounds = cpu_burn(deadline, &stop);
                    debug!(worker = idx, rounds, "load worker finished");
                });
            match spawned {
                Ok(handle) => workers.push(Worker::Thread(handle)),
                Err(e) => {
                    warn!(worker = idx, error = %e, "failed to spawn load worker");
                    errors.push(format!("worker {idx}: failed to spawn thread: {e}"));
                }
            }
        }

        if workers.is_empty() {
            return Err(EngineError::SpawnFailed(errors.join("; ")));
        }
        Ok(PoolHandle::new(workers, stop, errors))
    }
}

/// Tight integer loop with no syscalls besides the clock read. Returns the
/// number of batches completed.
pub fn cpu_burn(deadline: Instant, stop: &CancellationToken) -> u64 {
    let mut x: u64 = 0;
    let mut rounds = 0u64;
    while !stop.is_cancelled() && Instant::now() < deadline {
        for _ in 0..SPIN_BATCH {
            x = (x + 1) * 3 % 1_000_003;
        }
        x = std::hint::black_box(x);
        rounds += 1;
    }
    rounds
}
